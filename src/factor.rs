use std::{
    fmt,
    ops::{Index, IndexMut},
    str::FromStr,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One semantic facet of a brief or portfolio record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Factor {
    Full,
    Desc,
    What,
    How,
    Style,
}

/// Fixed concatenation order of the fused vector.
pub const FACTOR_ORDER: [Factor; 5] = [
    Factor::Full,
    Factor::Desc,
    Factor::What,
    Factor::How,
    Factor::Style,
];

/// The vector space a factor is encoded into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Space {
    /// Sentence encoder output.
    Sentence,
    /// Mean of per-token word vectors.
    Word,
}

impl Factor {
    pub fn name(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Desc => "desc",
            Self::What => "what",
            Self::How => "how",
            Self::Style => "style",
        }
    }

    pub fn space(self) -> Space {
        match self {
            Self::What => Space::Word,
            _ => Space::Sentence,
        }
    }

    fn slot(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Factor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Factor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        FACTOR_ORDER
            .into_iter()
            .find(|f| f.name() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| Error::Config(format!("unknown factor: {s}")))
    }
}

/// A value for each of the five factors, addressable by [`Factor`].
#[derive(
    Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema,
)]
pub struct PerFactor<T> {
    pub full: T,
    pub desc: T,
    pub what: T,
    pub how: T,
    pub style: T,
}

impl<T> PerFactor<T> {
    pub fn from_fn(mut f: impl FnMut(Factor) -> T) -> Self {
        Self {
            full: f(Factor::Full),
            desc: f(Factor::Desc),
            what: f(Factor::What),
            how: f(Factor::How),
            style: f(Factor::Style),
        }
    }

    pub fn try_from_fn<E>(
        mut f: impl FnMut(Factor) -> std::result::Result<T, E>,
    ) -> std::result::Result<Self, E> {
        Ok(Self {
            full: f(Factor::Full)?,
            desc: f(Factor::Desc)?,
            what: f(Factor::What)?,
            how: f(Factor::How)?,
            style: f(Factor::Style)?,
        })
    }

    pub fn map<U>(&self, mut f: impl FnMut(Factor, &T) -> U) -> PerFactor<U> {
        PerFactor::from_fn(|factor| f(factor, &self[factor]))
    }

    pub fn into_map<U>(self, mut f: impl FnMut(T) -> U) -> PerFactor<U> {
        PerFactor {
            full: f(self.full),
            desc: f(self.desc),
            what: f(self.what),
            how: f(self.how),
            style: f(self.style),
        }
    }

    /// Iterate in [`FACTOR_ORDER`].
    pub fn iter(&self) -> impl Iterator<Item = (Factor, &T)> {
        FACTOR_ORDER.into_iter().map(move |f| (f, &self[f]))
    }
}

impl<T> Index<Factor> for PerFactor<T> {
    type Output = T;

    fn index(&self, factor: Factor) -> &T {
        match factor.slot() {
            0 => &self.full,
            1 => &self.desc,
            2 => &self.what,
            3 => &self.how,
            _ => &self.style,
        }
    }
}

impl<T> IndexMut<Factor> for PerFactor<T> {
    fn index_mut(&mut self, factor: Factor) -> &mut T {
        match factor.slot() {
            0 => &mut self.full,
            1 => &mut self.desc,
            2 => &mut self.what,
            3 => &mut self.how,
            _ => &mut self.style,
        }
    }
}

/// Per-factor weights used for fusion and final score composition.
pub type FactorWeights = PerFactor<f32>;

impl FactorWeights {
    pub fn uniform(weight: f32) -> Self {
        Self::from_fn(|_| weight)
    }

    /// Weights must be finite and non-negative.
    pub fn validate(&self) -> Result<()> {
        for (factor, &w) in self.iter() {
            if !w.is_finite() || w < 0.0 {
                return Err(Error::Config(format!(
                    "{factor} weight must be a finite non-negative number, got {w}"
                )));
            }
        }
        Ok(())
    }

    pub fn sqrt(&self) -> Self {
        self.map(|_, w| w.sqrt())
    }
}

/// The four factors produced by extraction; `full` is derived from them.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct ExtractedFactors {
    #[serde(default)]
    pub desc: String,
    #[serde(default)]
    pub what: String,
    #[serde(default)]
    pub how: String,
    #[serde(default)]
    pub style: String,
}

impl ExtractedFactors {
    pub fn is_empty(&self) -> bool {
        [&self.desc, &self.what, &self.how, &self.style]
            .iter()
            .all(|s| s.trim().is_empty())
    }

    /// Deterministic composite text for the `full` factor.
    pub fn full_text(&self) -> String {
        format!(
            "desc: {}. what: {}. how: {}. style: {}",
            self.desc.trim(),
            self.what.trim(),
            self.how.trim(),
            self.style.trim()
        )
    }

    /// Expand to all five factor texts.
    pub fn into_texts(self) -> PerFactor<String> {
        let full = self.full_text();
        PerFactor {
            full,
            desc: self.desc.trim().to_string(),
            what: self.what.trim().to_string(),
            how: self.how.trim().to_string(),
            style: self.style.trim().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_matches_slots() {
        let values = PerFactor::from_fn(|f| f.name());
        let ordered: Vec<_> = values.iter().map(|(_, v)| *v).collect();
        assert_eq!(ordered, vec!["full", "desc", "what", "how", "style"]);
    }

    #[test]
    fn only_what_is_word_space() {
        for f in FACTOR_ORDER {
            assert_eq!(f.space() == Space::Word, f == Factor::What);
        }
    }

    #[test]
    fn parse_factor_names() {
        assert_eq!("Style".parse::<Factor>().unwrap(), Factor::Style);
        assert!("tone".parse::<Factor>().is_err());
    }

    #[test]
    fn full_text_is_deterministic() {
        let factors = ExtractedFactors {
            desc: " a calm skincare film ".to_string(),
            what: "cosmetics".to_string(),
            how: "video".to_string(),
            style: "minimal".to_string(),
        };
        assert_eq!(
            factors.full_text(),
            "desc: a calm skincare film. what: cosmetics. how: video. style: minimal"
        );
        let texts = factors.clone().into_texts();
        assert_eq!(texts.full, factors.full_text());
        assert_eq!(texts.desc, "a calm skincare film");
    }

    #[test]
    fn negative_weight_rejected() {
        let mut w = FactorWeights::uniform(1.0);
        assert!(w.validate().is_ok());
        w.how = -0.5;
        assert!(w.validate().is_err());
        w.how = f32::NAN;
        assert!(w.validate().is_err());
    }

    #[test]
    fn index_mut_targets_slot() {
        let mut w = FactorWeights::uniform(0.0);
        w[Factor::Desc] = 2.0;
        assert_eq!(w.desc, 2.0);
        assert_eq!(w.sqrt()[Factor::Desc], 2.0_f32.sqrt());
    }
}
