use crate::encoding::{argmax, collapse_repeats, Alphabet, GraphemeEncoding};
use crate::error::Result;

/// CTC grapheme space: the alphabet followed by one blank symbol.
#[derive(Debug, Clone)]
pub struct CtcGraphemeEncoding {
    alphabet: Alphabet,
}

impl CtcGraphemeEncoding {
    pub fn new(allowed_characters: &str) -> Result<Self> {
        Ok(Self {
            alphabet: Alphabet::new(allowed_characters)?,
        })
    }

    /// Blank sits after the last character, the slot CTC losses expect it in.
    pub fn blank_index(&self) -> usize {
        self.alphabet.len()
    }

    /// Best-path decoding of an already argmaxed symbol sequence.
    pub fn decode_path(&self, path: &[usize]) -> String {
        let blank = self.blank_index();
        collapse_repeats(path.iter().copied())
            .into_iter()
            .filter(|&symbol| symbol != blank)
            .filter_map(|symbol| self.alphabet.char_at(symbol))
            .collect()
    }
}

impl GraphemeEncoding for CtcGraphemeEncoding {
    fn alphabet(&self) -> &Alphabet {
        &self.alphabet
    }

    fn grapheme_set_size(&self) -> usize {
        self.alphabet.len() + 1
    }

    fn decode(&self, probabilities: &[Vec<f32>], output_length: usize) -> String {
        let path: Vec<usize> = probabilities
            .iter()
            .take(output_length)
            .filter_map(|row| argmax(row))
            .collect();
        self.decode_path(&path)
    }
}
