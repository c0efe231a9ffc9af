//! Admin credential generation for relocated instances.

use rand::seq::SliceRandom;
use rand::Rng;

pub const DEFAULT_PASSWORD_LENGTH: usize = 12;

// Ambiguous glyphs (0/O, 1/l/I) are left out.
const DIGITS: &[u8] = b"23456789";
const UPPERCASE: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";
const LOWERCASE: &[u8] = b"abcdefghijkmnopqrstuvwxyz";

const SYMBOL_GROUPS: [&[u8]; 3] = [DIGITS, UPPERCASE, LOWERCASE];

/// Generate a random password of `length` characters.
///
/// Each symbol group contributes at least one character when the length
/// allows it.
pub fn generate_password(length: usize) -> String {
    generate_password_with(&mut rand::thread_rng(), length)
}

pub fn generate_password_with<R: Rng + ?Sized>(rng: &mut R, length: usize) -> String {
    let mut password: Vec<u8> = SYMBOL_GROUPS
        .iter()
        .take(length)
        .filter_map(|group| group.choose(rng).copied())
        .collect();

    let all: Vec<u8> = SYMBOL_GROUPS.concat();
    while password.len() < length {
        if let Some(symbol) = all.choose(rng) {
            password.push(*symbol);
        }
    }

    password.shuffle(rng);
    password.into_iter().map(char::from).collect()
}
