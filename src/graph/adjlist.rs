use crate::error::{Error, Result};
use log::*;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

/// Immutable neighborhood structure. Each node keeps a map from neighbor
/// id to edge multiplicity; ids are dense in `[min_id, max_id]`.
#[derive(Debug, Clone, Default)]
pub struct AdjList {
    dat: Vec<BTreeMap<usize, u32>>,
    directed: bool,
    min_id: usize,
    n_edges: usize,
}

impl AdjList {
    /// Build from parallel source/target vectors. When `min_id`/`max_id`
    /// are `None` the range is inferred from the data; ids outside a
    /// supplied range are rejected.
    pub fn from_edgelist(
        source: &[usize],
        target: &[usize],
        directed: bool,
        min_id: Option<usize>,
        max_id: Option<usize>,
    ) -> Result<Self> {
        if source.len() != target.len() {
            return Err(Error::invalid(format!(
                "source has {} entries but target has {}",
                source.len(),
                target.len()
            )));
        }

        let lo = match min_id {
            Some(lo) => lo,
            None => source.iter().chain(target).min().copied().unwrap_or(0),
        };
        let hi = match max_id {
            Some(hi) => hi,
            None => source.iter().chain(target).max().copied().unwrap_or(0),
        };
        if hi < lo {
            return Err(Error::invalid(format!("max_id {} below min_id {}", hi, lo)));
        }

        let mut al = AdjList {
            dat: vec![BTreeMap::new(); hi - lo + 1],
            directed,
            min_id: lo,
            n_edges: 0,
        };

        for (m, (&i, &j)) in source.iter().zip(target).enumerate() {
            if i < lo || i > hi {
                return Err(Error::out_of_range(format!(
                    "source[{}] = {} outside [{}, {}]",
                    m, i, lo, hi
                )));
            }
            if j < lo || j > hi {
                return Err(Error::out_of_range(format!(
                    "target[{}] = {} outside [{}, {}]",
                    m, j, lo, hi
                )));
            }
            al.insert(i - lo, j - lo);
        }

        Ok(al)
    }

    /// Read a whitespace-separated `src dst` edgelist. The first `skip`
    /// lines of the file are discarded before any parsing.
    pub fn read_edgelist(
        path: impl AsRef<Path>,
        skip: usize,
        directed: bool,
        min_id: Option<usize>,
        max_id: Option<usize>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut source = Vec::new();
        let mut target = Vec::new();

        for (linenum, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if linenum < skip {
                continue;
            }
            let mut it = line.split_whitespace();
            let (i, j) = match (it.next(), it.next()) {
                (Some(i), Some(j)) => (i, j),
                (None, _) => continue, // blank line
                _ => {
                    return Err(Error::invalid(format!(
                        "{}:{}: expected `src dst`, got {:?}",
                        path.display(),
                        linenum + 1,
                        line
                    )))
                }
            };
            let parse = |tok: &str| {
                tok.parse::<usize>().map_err(|_| {
                    Error::invalid(format!(
                        "{}:{}: invalid id {:?}",
                        path.display(),
                        linenum + 1,
                        tok
                    ))
                })
            };
            source.push(parse(i)?);
            target.push(parse(j)?);
        }

        debug!("read {} edges from {}", source.len(), path.display());
        Self::from_edgelist(&source, &target, directed, min_id, max_id)
    }

    fn insert(&mut self, i: usize, j: usize) {
        *self.dat[i].entry(j).or_insert(0) += 1;
        if !self.directed {
            *self.dat[j].entry(i).or_insert(0) += 1;
        }
        self.n_edges += 1;
    }

    /// Number of vertices.
    pub fn vcount(&self) -> usize {
        self.dat.len()
    }

    /// Number of inserted edges (reverse edges of undirected graphs are
    /// not counted twice).
    pub fn ecount(&self) -> usize {
        self.n_edges
    }

    pub fn is_directed(&self) -> bool {
        self.directed
    }

    pub fn min_id(&self) -> usize {
        self.min_id
    }

    /// Neighbors of vertex `i` (0-based, offset by `min_id`).
    pub fn neighbors(&self, i: usize) -> Result<&BTreeMap<usize, u32>> {
        self.dat
            .get(i)
            .ok_or_else(|| Error::out_of_range(format!("vertex {} not in the network", i)))
    }

    /// Degree counting multiplicities.
    pub fn degree(&self, i: usize) -> usize {
        self.dat
            .get(i)
            .map(|m| m.values().map(|&w| w as usize).sum())
            .unwrap_or(0)
    }

    pub(crate) fn dat(&self) -> &[BTreeMap<usize, u32>] {
        &self.dat
    }

    pub(crate) fn dat_mut(&mut self) -> &mut [BTreeMap<usize, u32>] {
        &mut self.dat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn undirected_mirrors_edges() {
        let al = AdjList::from_edgelist(&[0, 1], &[1, 2], false, None, None).unwrap();
        assert_eq!(al.vcount(), 3);
        assert_eq!(al.ecount(), 2);
        assert!(al.neighbors(1).unwrap().contains_key(&0));
        assert!(al.neighbors(1).unwrap().contains_key(&2));
        assert!(al.neighbors(2).unwrap().contains_key(&1));
    }

    #[test]
    fn directed_does_not_mirror() {
        let al = AdjList::from_edgelist(&[0], &[1], true, None, None).unwrap();
        assert!(al.neighbors(0).unwrap().contains_key(&1));
        assert!(al.neighbors(1).unwrap().is_empty());
    }

    #[test]
    fn multiplicity_accumulates() {
        let al = AdjList::from_edgelist(&[0, 0], &[1, 1], true, None, None).unwrap();
        assert_eq!(al.neighbors(0).unwrap()[&1], 2);
        assert_eq!(al.degree(0), 2);
    }

    #[test]
    fn id_out_of_declared_range_fails() {
        let res = AdjList::from_edgelist(&[0, 5], &[1, 1], false, Some(0), Some(3));
        assert!(matches!(res, Err(Error::OutOfRange(_))));
    }

    #[test]
    fn read_edgelist_skips_header_lines() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "source target").unwrap();
        writeln!(f, "0 1").unwrap();
        writeln!(f, "1 2").unwrap();
        let al = AdjList::read_edgelist(f.path(), 1, false, None, None).unwrap();
        assert_eq!(al.vcount(), 3);
        assert_eq!(al.ecount(), 2);
    }

    #[test]
    fn read_edgelist_missing_file() {
        let res = AdjList::read_edgelist("/no/such/file", 0, false, None, None);
        assert!(matches!(res, Err(Error::Io(_))));
    }
}
