//! Host code buffer.
//!
//! Append-only store of 32-bit host words. Once a word is appended its index
//! is fixed for the lifetime of the buffer; later passes may only rewrite its
//! bit pattern or drop the final word. Fixups and branch-over placeholders
//! refer to words by index, so the backing `Vec` may reallocate freely.

use crate::arm64::enc;
use crate::arm64::registers::XReg;

#[derive(Clone, Debug, Default)]
pub struct CodeBuffer {
    words: Vec<u32>,
}

impl CodeBuffer {
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    #[must_use]
    pub fn with_capacity(words: usize) -> Self {
        Self {
            words: Vec::with_capacity(words),
        }
    }

    /// Index of the next word to be written.
    #[must_use]
    pub fn ip(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.words.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Append one word, returning its index.
    pub fn emit(&mut self, word: u32) -> usize {
        let at = self.words.len();
        self.words.push(word);
        at
    }

    pub fn emit_all(&mut self, words: impl IntoIterator<Item = u32>) {
        self.words.extend(words);
    }

    #[must_use]
    pub fn read(&self, index: usize) -> Option<u32> {
        self.words.get(index).copied()
    }

    /// Overwrite an existing word.
    ///
    /// # Panics
    /// If `index` was never written; that is a pipeline defect.
    pub fn write(&mut self, index: usize, word: u32) {
        self.words[index] = word;
    }

    /// Drop the final word.
    pub fn erase_last(&mut self) -> Option<u32> {
        self.words.pop()
    }

    /// Word displacement from `from` to `to`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn disp(from: usize, to: usize) -> i64 {
        to as i64 - from as i64
    }

    /// Load a 32-bit constant into `wd` (one or two words).
    pub fn emit_mov_imm32(&mut self, rd: XReg, value: u32) {
        let lo = (value & 0xFFFF) as u16;
        let hi = (value >> 16) as u16;
        if hi == 0 {
            self.emit(enc::movz_w(rd, lo, 0));
        } else if lo == 0 {
            self.emit(enc::movz_w(rd, hi, 1));
        } else {
            self.emit(enc::movz_w(rd, lo, 0));
            self.emit(enc::movk_w(rd, hi, 1));
        }
    }

    /// Load a 64-bit absolute address into `xd` (one to four words).
    pub fn emit_mov_imm64(&mut self, rd: XReg, value: u64) {
        let mut first = true;
        for hw in 0..4u32 {
            let chunk = ((value >> (hw * 16)) & 0xFFFF) as u16;
            if chunk == 0 {
                continue;
            }
            if first {
                self.emit(enc::movz_x(rd, chunk, hw));
                first = false;
            } else {
                self.emit(enc::movk_x(rd, chunk, hw));
            }
        }
        if first {
            self.emit(enc::movz_x(rd, 0, 0));
        }
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[must_use]
    pub fn into_words(self) -> Vec<u32> {
        self.words
    }

    /// Little-endian byte image.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}
