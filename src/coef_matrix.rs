// src/coef_matrix.rs
//
// Symmetric region x region exchange coefficient tables.
//
// One table per coupling channel (lattice 1, lattice 2, cross-lattice). Entries
// are either stiffness A (J/m) or exchange length lex (m) for every channel of
// one exchange term, never a mix. Tables are immutable once built.

use serde::{Deserialize, Serialize};

use crate::atlas::RegionAtlas;
use crate::error::{LlbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeCoefType {
    /// Exchange stiffness A (J/m).
    Stiffness,
    /// Exchange length lex (m).
    ExchangeLength,
}

impl ExchangeCoefType {
    pub fn key(self) -> &'static str {
        match self {
            ExchangeCoefType::Stiffness => "A",
            ExchangeCoefType::ExchangeLength => "lex",
        }
    }
}

/// Largest region count whose square still fits a signed index of the
/// platform's pointer width (sqrt(2^(bits-1)), rounded down).
pub fn max_region_count() -> usize {
    max_region_count_for_bytes(std::mem::size_of::<usize>())
}

fn max_region_count_for_bytes(bytes: usize) -> usize {
    if bytes == 1 {
        return 11;
    }
    // bits-1 is odd, so 2^sqrootbits is short by a factor sqrt(2); fix up with a
    // rational upper bound of sqrt(2).
    let sqrootbits = (bytes * 8 - 1) / 2;
    let coef_check: u128 = 1u128 << sqrootbits;
    let adjusted = if bytes < 5 {
        (coef_check * 239 + 168) / 169 - 1
    } else {
        (coef_check * 275_807 + 195_024) / 195_025 - 1
    };
    usize::try_from(adjusted).unwrap_or(usize::MAX)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoefMatrix {
    size: usize,
    data: Vec<f64>,
}

impl CoefMatrix {
    /// Build a table for `atlas` from a flat list of (regionA, regionB, value)
    /// triples. Pairs not listed take `default`.
    ///
    /// `channel` names the list in error messages (e.g. "A1", "lex12").
    pub fn build(atlas: &dyn RegionAtlas, channel: &str, default: f64, entries: &[String]) -> Result<Self> {
        let size = atlas.region_count();
        if size < 1 {
            return Err(LlbError::config(format!(
                "atlas \"{}\" must contain at least one region",
                atlas.name()
            )));
        }
        let max = max_region_count();
        if size > max {
            return Err(LlbError::config(format!(
                "atlas \"{}\" has too many regions: {} (max allowed: {})",
                atlas.name(),
                size,
                max
            )));
        }
        if entries.is_empty() {
            return Err(LlbError::config(format!(
                "empty parameter list for key \"{}\"",
                channel
            )));
        }
        if entries.len() % 3 != 0 {
            return Err(LlbError::config(format!(
                "number of elements in {} sub-list must be divisible by 3 (actual sub-list size: {})",
                channel,
                entries.len()
            )));
        }

        // Everything is resolved before the table is allocated; an error leaves nothing behind.
        let mut pairs = Vec::with_capacity(entries.len() / 3);
        for (k, triple) in entries.chunks_exact(3).enumerate() {
            let i = resolve(atlas, channel, k, "First", &triple[0])?;
            let j = resolve(atlas, channel, k, "Second", &triple[1])?;
            let value: f64 = triple[2].trim().parse().map_err(|_| {
                LlbError::config(format!(
                    "Third entry in {}[{}] sub-list, \"{}\", is not a valid floating point number",
                    channel, k, triple[2]
                ))
            })?;
            pairs.push((i, j, value));
        }

        let mut data = vec![default; size * size];
        for (i, j, value) in pairs {
            data[i * size + j] = value;
            data[j * size + i] = value;
        }
        Ok(Self { size, data })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.size + j]
    }

    /// Row `i`, indexed by the partner region.
    #[inline]
    pub fn row(&self, i: usize) -> &[f64] {
        &self.data[i * self.size..(i + 1) * self.size]
    }

    pub fn is_symmetric(&self) -> bool {
        (0..self.size).all(|i| (0..i).all(|j| self.get(i, j) == self.get(j, i)))
    }
}

fn resolve(atlas: &dyn RegionAtlas, channel: &str, k: usize, which: &str, name: &str) -> Result<usize> {
    atlas.region_id_by_name(name).ok_or_else(|| {
        let mut msg = format!(
            "{} entry in {}[{}] sub-list, \"{}\", is not a known region in atlas \"{}\".  Known regions:",
            which,
            channel,
            k,
            name,
            atlas.name()
        );
        for r in atlas.region_names() {
            msg.push(' ');
            msg.push_str(&r);
        }
        LlbError::config(msg)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atlas::{BoxAtlas, RegionBox};

    fn atlas3() -> BoxAtlas {
        let r = |name: &str, x0: f64| RegionBox {
            name: name.into(),
            min: [x0, 0.0, 0.0],
            max: [x0 + 1.0, 1.0, 1.0],
        };
        BoxAtlas::new("stack", vec![r("a", 0.0), r("b", 1.0), r("c", 2.0)]).unwrap()
    }

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn max_region_count_matches_index_width() {
        // 8-byte index: floor(sqrt(2^63)) - 1 style bound.
        let m8 = max_region_count_for_bytes(8);
        assert_eq!(m8, (2147483648u128 * 275807 + 195024) as usize / 195025 - 1);
        assert!((m8 as u128) * (m8 as u128) < (1u128 << 63));
        let m4 = max_region_count_for_bytes(4);
        assert!((m4 as u64) * (m4 as u64) < (1u64 << 31));
        assert_eq!(max_region_count_for_bytes(1), 11);
    }

    #[test]
    fn unknown_region_lists_known_ones() {
        let a = atlas3();
        let err = CoefMatrix::build(&a, "A1", 0.0, &strings(&["a", "zz", "1e-12"])).unwrap_err();
        match err {
            LlbError::Config(msg) => {
                assert!(msg.starts_with("Second entry in A1[0] sub-list, \"zz\""));
                assert!(msg.ends_with("Known regions: a b c"));
            }
            e => panic!("unexpected {:?}", e),
        }
    }

    #[test]
    fn bad_lists_are_rejected() {
        let a = atlas3();
        assert!(CoefMatrix::build(&a, "A1", 0.0, &strings(&["a", "b"])).is_err());
        assert!(CoefMatrix::build(&a, "A1", 0.0, &[]).is_err());
        let err = CoefMatrix::build(&a, "A2", 0.0, &strings(&["a", "b", "one"])).unwrap_err();
        assert!(format!("{}", err).contains("is not a valid floating point number"));
    }

    #[test]
    fn diagonal_and_default_fill() {
        let a = atlas3();
        let m = CoefMatrix::build(&a, "A1", 7.0, &strings(&["c", "c", "3"])).unwrap();
        assert_eq!(m.get(2, 2), 3.0);
        assert_eq!(m.get(0, 0), 7.0);
        assert_eq!(m.row(1), &[7.0, 7.0, 7.0]);
    }
}
