//! The secret store: an accessible prefix followed by a secret suffix.

use bitvec::prelude::*;
use rand::Rng;
use std::ops::Range;

/// Architecturally-accessible prefix.
pub const DEFAULT_PREFIX: &[u8] = b"data|";

/// Inaccessible secret (following the accessible prefix).
///
/// Randomly generated with the only constraint that it contains as many
/// zeros as ones.
pub const DEFAULT_SECRET: [u8; 32] = [
    0x01, 0x36, 0x9b, 0x78, 0xc9, 0x2c, 0x3d, 0x32,
    0xfa, 0x83, 0x50, 0xaf, 0x39, 0xaf, 0x69, 0x2d,
    0x58, 0xd7, 0x38, 0x6a, 0xc1, 0x63, 0x15, 0xc7,
    0x3c, 0x4d, 0x96, 0x61, 0xe1, 0x88, 0xbd, 0xed,
];

/// Capacity of the backing buffer in bytes.
pub const STORE_CAPACITY: usize = 128;

/// Backing buffer for the prefix and secret, plus the architectural bound.
///
/// Any read of `data[i]` with `i * 8 < accessible_bits` is a legal access.
/// Reads past that boundary must only ever happen on a mispredicted path.
/// The leak variants read `accessible_bits` through [`SecretStore::bound`]
/// after flushing [`SecretStore::bound_ptr`], so it is kept as a plain field
/// with a stable address for the lifetime of the store.
#[repr(C, align(64))]
pub struct SecretStore {
    data: [u8; STORE_CAPACITY],
    accessible_bits: usize,
    secret_len: usize,
}

impl SecretStore {
    /// Build a store from an accessible prefix and a secret suffix.
    ///
    /// The rest of the buffer is filled with ASCII spaces, the byte after the
    /// secret is NUL and the last byte is `'0'`.
    pub fn new(prefix: &[u8], secret: &[u8]) -> Self {
        assert!(prefix.len() + secret.len() + 1 < STORE_CAPACITY,
            "prefix ({}) and secret ({}) don't fit into {} bytes",
            prefix.len(), secret.len(), STORE_CAPACITY
        );
        let mut data = [b' '; STORE_CAPACITY];
        data[..prefix.len()].copy_from_slice(prefix);
        let secret_start = prefix.len();
        data[secret_start..secret_start + secret.len()].copy_from_slice(secret);
        data[secret_start + secret.len()] = 0;
        data[STORE_CAPACITY - 1] = b'0';

        Self {
            data,
            accessible_bits: prefix.len() * 8,
            secret_len: secret.len(),
        }
    }

    /// Build a store with a randomly-generated secret of `len` bytes which
    /// contains exactly as many zeros as ones.
    pub fn random_balanced(rng: &mut impl Rng, len: usize) -> Self {
        let mut secret = vec![0u8; len];
        let total = len * 8;
        let bits = secret.view_bits_mut::<Lsb0>();
        let mut ones = 0;
        while ones < total / 2 {
            let idx = rng.gen_range(0..total);
            if !bits[idx] {
                bits.set(idx, true);
                ones += 1;
            }
        }
        Self::new(DEFAULT_PREFIX, &secret)
    }

    /// The architectural bound (in bits).
    pub fn accessible_bits(&self) -> usize { self.accessible_bits }

    /// Read the architectural bound through memory.
    ///
    /// This is the load that the flush/no-flush variants race against.
    #[inline(always)]
    pub fn bound(&self) -> usize {
        unsafe { std::ptr::read_volatile(&self.accessible_bits) }
    }

    /// Address of the bound, for flushing.
    pub fn bound_ptr(&self) -> *const u8 {
        &self.accessible_bits as *const usize as *const u8
    }

    /// Base address of the buffer.
    ///
    /// The leak variants index this directly so that no bounds check
    /// (and no extra branch) sits between the bound check and the access.
    pub fn data_ptr(&self) -> *const u8 { self.data.as_ptr() }

    /// The whole backing buffer.
    pub fn data(&self) -> &[u8] { &self.data }

    /// Byte range holding the secret suffix.
    pub fn secret_range(&self) -> Range<usize> {
        let start = self.accessible_bits / 8;
        start..start + self.secret_len
    }

    /// The secret suffix.
    pub fn secret(&self) -> &[u8] { &self.data[self.secret_range()] }

    /// Reference bit view of the buffer (LSB-first within each byte, which
    /// matches how the leak variants index bits).
    pub fn bits(&self) -> &BitSlice<u8, Lsb0> {
        self.data.view_bits::<Lsb0>()
    }

    /// Returns the value of bit `idx`, or `None` when it is out of range
    /// of the backing buffer.
    pub fn bit(&self, idx: usize) -> Option<bool> {
        self.bits().get(idx).map(|b| *b)
    }
}

impl Default for SecretStore {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX, &DEFAULT_SECRET)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_layout() {
        let s = SecretStore::default();
        assert_eq!(s.accessible_bits(), 40);
        assert_eq!(s.bound(), 40);
        assert_eq!(&s.data()[..5], b"data|");
        assert_eq!(s.secret(), &DEFAULT_SECRET);
        assert_eq!(s.data()[5 + 32], 0);
        assert_eq!(s.data()[STORE_CAPACITY - 2], b' ');
        assert_eq!(s.data()[STORE_CAPACITY - 1], b'0');
    }

    #[test]
    fn default_secret_is_balanced() {
        let ones: u32 = DEFAULT_SECRET.iter().map(|b| b.count_ones()).sum();
        assert_eq!(ones as usize, DEFAULT_SECRET.len() * 8 / 2);
    }

    #[test]
    fn bit_order_is_lsb_first() {
        let s = SecretStore::default();
        // 'd' = 0x64 = 0b0110_0100
        let expected = [false, false, true, false, false, true, true, false];
        for (i, e) in expected.iter().enumerate() {
            assert_eq!(s.bit(i), Some(*e), "bit {}", i);
        }
        for i in 0..s.data().len() * 8 {
            let raw = s.data()[i / 8] & (1 << (i % 8)) != 0;
            assert_eq!(s.bit(i), Some(raw));
        }
        assert_eq!(s.bit(STORE_CAPACITY * 8), None);
    }

    #[test]
    fn random_secret_is_balanced() {
        let mut rng = rand::thread_rng();
        for len in [1, 8, 32] {
            let s = SecretStore::random_balanced(&mut rng, len);
            let ones: u32 = s.secret().iter().map(|b| b.count_ones()).sum();
            assert_eq!(ones as usize, len * 4);
            assert_eq!(s.accessible_bits(), DEFAULT_PREFIX.len() * 8);
        }
    }
}
