//! Primality and mod-12 residue helpers.
//!
//! Every prime greater than 3 is congruent to 1, 5, 7 or 11 modulo 12; the
//! other eight residue classes contain at most the primes 2 and 3. Filtered
//! partition nodes lean on this to skip most candidates outright.

/// Residue classes (mod 12) that contain all primes greater than 3.
pub const PRIME_RESIDUES: [u8; 4] = [1, 5, 7, 11];

/// Number of residue classes a range is split into.
pub const RESIDUE_CLASSES: usize = 12;

/// Trial division by 2, 3 and then `6k ± 1` up to `sqrt(n)`.
pub fn is_prime(n: u64) -> bool {
    if n <= 1 {
        return false;
    }
    if n <= 3 {
        return true;
    }
    if n % 2 == 0 || n % 3 == 0 {
        return false;
    }

    // `i <= n / i` instead of `i * i <= n` keeps this overflow-free near u64::MAX.
    let mut i = 5u64;
    while i <= n / i {
        if n % i == 0 || n % (i + 2) == 0 {
            return false;
        }
        i += 6;
    }
    true
}

/// `n mod 12` as a class index.
#[inline]
pub fn residue_of(n: u64) -> u8 {
    (n % RESIDUE_CLASSES as u64) as u8
}

/// Counts the primes in `[start, end]` per residue class.
pub fn residue_distribution(start: u64, end: u64) -> [usize; RESIDUE_CLASSES] {
    let mut distribution = [0usize; RESIDUE_CLASSES];
    if start > end {
        return distribution;
    }
    for n in start..=end {
        if is_prime(n) {
            distribution[residue_of(n) as usize] += 1;
        }
    }
    distribution
}

/// Checks that no prime above 3 in `[start, end]` falls outside
/// [`PRIME_RESIDUES`].
pub fn verify_symmetry(start: u64, end: u64) -> bool {
    if start > end {
        return true;
    }
    (start.max(4)..=end)
        .filter(|&n| is_prime(n))
        .all(|n| PRIME_RESIDUES.contains(&residue_of(n)))
}
