//! Blowfish: 64-bit symmetric block cipher with a variable-length key of up
//! to 448 bits (56 bytes), used to protect DATA payloads on the wire.
//!
//! Payloads are encrypted as concatenated independent 8-byte blocks (ECB)
//! after PKCS#5 padding: 1..=8 bytes are always appended, each equal to the
//! number of bytes added, so padding can be removed unambiguously after
//! decryption.
//!
//! The key schedule and round structure follow the reference implementation:
//! the 18-entry P array and the flat 1024-entry S array (four 256-entry
//! boxes) are seeded from the pi-derived constants, XOR'ed with the cycled
//! key bytes, then replaced pairwise by repeatedly encrypting the previous
//! output starting from the all-zero block.

mod tables;

use crate::error::{BusError, BusResult};

pub const BLOCK_SIZE: usize = 8;
const ROUNDS: usize = 16;
const MAX_KEY_LEN: usize = 448 / 8;

/// Optional payload protection seam: the bus encrypts and decrypts DATA
/// payloads through this trait so that a key-less configuration pays nothing.
pub trait PayloadCipher: Send + Sync + 'static {
    /// Whether outgoing payloads are ciphertext (sets the `encrypted` header
    /// flag on DATA packets).
    fn is_active(&self) -> bool;

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8>;

    fn decrypt(&self, ciphertext: &[u8]) -> BusResult<Vec<u8>>;
}

/// Pass-through used when no cipher key is configured.
pub struct Cleartext;

impl PayloadCipher for Cleartext {
    fn is_active(&self) -> bool {
        false
    }

    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        plaintext.to_vec()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> BusResult<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// A Blowfish cipher instance. The key schedule runs once in [`MessageCipher::new`];
/// the resulting P/S state is immutable for the life of the session key.
pub struct MessageCipher {
    p: [u32; 18],
    s: [u32; 1024],
}

impl MessageCipher {
    /// Expand a 1..=56 byte user key into the session P array and S boxes.
    /// Longer keys are truncated to 56 bytes; an empty key is rejected.
    pub fn new(key: &[u8]) -> BusResult<MessageCipher> {
        if key.is_empty() {
            return Err(BusError::InvalidKey);
        }
        let key = &key[..key.len().min(MAX_KEY_LEN)];

        let mut s = [0u32; 1024];
        s[0..256].copy_from_slice(&tables::S0_INIT);
        s[256..512].copy_from_slice(&tables::S1_INIT);
        s[512..768].copy_from_slice(&tables::S2_INIT);
        s[768..1024].copy_from_slice(&tables::S3_INIT);

        // XOR the initial P entries with the key bytes, cycling over the key.
        // Byte 0 of the key lands in the most significant byte of the first
        // XOR word.
        let mut p = [0u32; 18];
        let mut j = 0;
        for (i, entry) in p.iter_mut().enumerate() {
            let mut word = 0u32;
            for _ in 0..4 {
                word = (word << 8) | key[j] as u32;
                j = (j + 1) % key.len();
            }
            *entry = tables::P_INIT[i] ^ word;
        }

        let mut cipher = MessageCipher { p, s };

        // Replace all P entries, then all S entries, pairwise with the
        // chained encryptions of the all-zero block.
        let (mut hi, mut lo) = (0u32, 0u32);
        for i in (0..cipher.p.len()).step_by(2) {
            (hi, lo) = cipher.encrypt_words(hi, lo);
            cipher.p[i] = hi;
            cipher.p[i + 1] = lo;
        }
        for i in (0..cipher.s.len()).step_by(2) {
            (hi, lo) = cipher.encrypt_words(hi, lo);
            cipher.s[i] = hi;
            cipher.s[i + 1] = lo;
        }

        Ok(cipher)
    }

    /// The round function: S-box lookups on the four bytes of `x`, combined
    /// with addition modulo 2^32 and XOR.
    #[inline]
    fn f(&self, x: u32) -> u32 {
        let a = self.s[(x >> 24) as usize];
        let b = self.s[0x100 | ((x >> 16) & 0xff) as usize];
        let c = self.s[0x200 | ((x >> 8) & 0xff) as usize];
        let d = self.s[0x300 | (x & 0xff) as usize];
        (a.wrapping_add(b) ^ c).wrapping_add(d)
    }

    /// Run the 16 encryption rounds on a block given as two 32-bit words.
    /// Returns the output block's words in wire order, i.e. already swapped
    /// relative to the final round's L/R assignment.
    fn encrypt_words(&self, mut l: u32, mut r: u32) -> (u32, u32) {
        l ^= self.p[0];
        for i in (1..ROUNDS).step_by(2) {
            r ^= self.f(l) ^ self.p[i];
            l ^= self.f(r) ^ self.p[i + 1];
        }
        r ^= self.p[ROUNDS + 1];
        (r, l)
    }

    /// Decryption rounds: same structure with P applied in reverse order.
    fn decrypt_words(&self, mut l: u32, mut r: u32) -> (u32, u32) {
        l ^= self.p[ROUNDS + 1];
        for i in (1..ROUNDS).step_by(2).rev() {
            r ^= self.f(l) ^ self.p[i + 1];
            l ^= self.f(r) ^ self.p[i];
        }
        r ^= self.p[0];
        (r, l)
    }

    pub fn encrypt_block(&self, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let l = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
        let r = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
        let (hi, lo) = self.encrypt_words(l, r);
        words_to_block(hi, lo)
    }

    pub fn decrypt_block(&self, block: [u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let l = u32::from_be_bytes([block[0], block[1], block[2], block[3]]);
        let r = u32::from_be_bytes([block[4], block[5], block[6], block[7]]);
        let (hi, lo) = self.decrypt_words(l, r);
        words_to_block(hi, lo)
    }
}

fn words_to_block(hi: u32, lo: u32) -> [u8; BLOCK_SIZE] {
    let mut out = [0u8; BLOCK_SIZE];
    out[0..4].copy_from_slice(&hi.to_be_bytes());
    out[4..8].copy_from_slice(&lo.to_be_bytes());
    out
}

impl PayloadCipher for MessageCipher {
    fn is_active(&self) -> bool {
        true
    }

    /// PKCS#5-pad and encrypt. The output length is the smallest multiple of
    /// 8 strictly greater than the input length.
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let pad = BLOCK_SIZE - plaintext.len() % BLOCK_SIZE;

        let mut data = Vec::with_capacity(plaintext.len() + pad);
        data.extend_from_slice(plaintext);
        data.resize(plaintext.len() + pad, pad as u8);

        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            let block = self.encrypt_block([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]);
            chunk.copy_from_slice(&block);
        }
        data
    }

    /// Decrypt and strip PKCS#5 padding. Fails when the input length is not
    /// a positive multiple of 8 or the final pad byte is outside 1..=8.
    fn decrypt(&self, ciphertext: &[u8]) -> BusResult<Vec<u8>> {
        if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(BusError::InvalidCiphertext);
        }

        let mut data = ciphertext.to_vec();
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            let block = self.decrypt_block([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]);
            chunk.copy_from_slice(&block);
        }

        let pad = data[data.len() - 1] as usize;
        if pad == 0 || pad > BLOCK_SIZE {
            return Err(BusError::InvalidCiphertext);
        }
        data.truncate(data.len() - pad);
        Ok(data)
    }
}
