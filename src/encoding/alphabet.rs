use std::collections::HashMap;

use crate::error::{Result, Wav2LetterError};
use crate::types::TargetSequence;

/// Ordered set of label characters; a character's position is its grapheme index.
#[derive(Debug, Clone)]
pub struct Alphabet {
    characters: Vec<char>,
    index_by_char: HashMap<char, u32>,
}

impl Alphabet {
    pub fn new(allowed_characters: &str) -> Result<Self> {
        let characters: Vec<char> = allowed_characters.chars().collect();
        if characters.is_empty() {
            return Err(Wav2LetterError::configuration("alphabet is empty"));
        }
        let mut index_by_char = HashMap::with_capacity(characters.len());
        for (index, &c) in characters.iter().enumerate() {
            if index_by_char.insert(c, index as u32).is_some() {
                return Err(Wav2LetterError::configuration(format!(
                    "alphabet lists {c:?} more than once"
                )));
            }
        }
        Ok(Self {
            characters,
            index_by_char,
        })
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }

    pub fn index_of(&self, c: char) -> Option<u32> {
        self.index_by_char.get(&c).copied()
    }

    pub fn char_at(&self, index: usize) -> Option<char> {
        self.characters.get(index).copied()
    }

    pub fn contains_all(&self, label: &str) -> bool {
        label.chars().all(|c| self.index_by_char.contains_key(&c))
    }

    /// Maps every character; never drops unknown ones.
    pub fn encode(&self, label: &str) -> Result<TargetSequence> {
        let indices = label
            .chars()
            .map(|c| {
                self.index_of(c).ok_or_else(|| Wav2LetterError::Encoding {
                    character: c,
                    label: label.to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(TargetSequence { indices })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_follow_character_order() {
        let alphabet = Alphabet::new(" ab").unwrap();
        assert_eq!(alphabet.len(), 3);
        assert_eq!(alphabet.index_of(' '), Some(0));
        assert_eq!(alphabet.index_of('b'), Some(2));
        assert_eq!(alphabet.char_at(1), Some('a'));
        assert_eq!(alphabet.char_at(3), None);
    }

    #[test]
    fn duplicate_and_empty_alphabets_are_rejected() {
        assert!(matches!(
            Alphabet::new("abca"),
            Err(Wav2LetterError::Configuration { .. })
        ));
        assert!(Alphabet::new("").is_err());
    }

    #[test]
    fn encode_reports_the_offending_character() {
        let alphabet = Alphabet::new("ab ").unwrap();
        assert_eq!(alphabet.encode("ab a").unwrap().indices, vec![0, 1, 2, 0]);
        match alphabet.encode("abc") {
            Err(Wav2LetterError::Encoding { character, label }) => {
                assert_eq!(character, 'c');
                assert_eq!(label, "abc");
            }
            other => panic!("expected encoding error, got {other:?}"),
        }
        assert!(!alphabet.contains_all("abc"));
    }
}
