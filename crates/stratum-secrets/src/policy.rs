use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::SecretError;
use crate::value::SecretValue;

const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const DIGITS: &str = "0123456789";
const DEFAULT_SPECIAL: &str = "!#$%&*()-_=+[]{}<>:?";
const MAX_LENGTH: usize = 4096;

/// Composition rules for a generated secret value.
///
/// Every enabled character class is guaranteed to appear at least once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationPolicy {
    pub length: usize,
    pub upper: bool,
    pub lower: bool,
    pub digits: bool,
    pub special: bool,
    pub special_chars: String,
}

impl Default for GenerationPolicy {
    fn default() -> Self {
        Self {
            length: 32,
            upper: true,
            lower: true,
            digits: true,
            special: true,
            special_chars: DEFAULT_SPECIAL.to_string(),
        }
    }
}

impl GenerationPolicy {
    pub fn with_length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn without_special(mut self) -> Self {
        self.special = false;
        self
    }

    fn classes(&self) -> Vec<Vec<char>> {
        let mut classes = Vec::new();
        if self.upper {
            classes.push(UPPER.chars().collect());
        }
        if self.lower {
            classes.push(LOWER.chars().collect());
        }
        if self.digits {
            classes.push(DIGITS.chars().collect());
        }
        if self.special {
            classes.push(self.special_chars.chars().collect());
        }
        classes
    }

    pub fn validate(&self) -> Result<(), SecretError> {
        if self.special && self.special_chars.is_empty() {
            return Err(SecretError::InvalidPolicy(
                "special characters enabled but none configured".into(),
            ));
        }
        let classes = self.classes().len();
        if classes == 0 {
            return Err(SecretError::InvalidPolicy(
                "at least one character class must be enabled".into(),
            ));
        }
        if self.length < classes {
            return Err(SecretError::InvalidPolicy(format!(
                "length {} cannot hold {classes} required character classes",
                self.length
            )));
        }
        if self.length > MAX_LENGTH {
            return Err(SecretError::InvalidPolicy(format!(
                "length {} exceeds maximum of {MAX_LENGTH}",
                self.length
            )));
        }
        Ok(())
    }

    /// Generate a value using the thread-local RNG.
    pub fn generate(&self) -> Result<SecretValue, SecretError> {
        self.generate_with(&mut rand::thread_rng())
    }

    /// Generate a value: one character from each enabled class, the rest
    /// drawn from their union, then shuffled.
    pub fn generate_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<SecretValue, SecretError> {
        self.validate()?;
        let classes = self.classes();
        let pool: Vec<char> = classes.iter().flatten().copied().collect();

        let mut chars: Vec<char> = Vec::with_capacity(self.length);
        for class in &classes {
            if let Some(c) = class.choose(rng) {
                chars.push(*c);
            }
        }
        while chars.len() < self.length {
            if let Some(c) = pool.choose(rng) {
                chars.push(*c);
            }
        }
        chars.shuffle(rng);

        Ok(SecretValue::new(chars.into_iter().collect::<String>()))
    }
}
