use crate::error::{Error, Result};
use crate::prelude::Real;
use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::path::Path;

/// Aggregates one or more transition tables (the `date from to counts`
/// output of the database) into a state-transition graph, optionally
/// row-normalized into probabilities, and renders it as Mermaid.
#[derive(Debug, Clone, Default)]
pub struct ModelDiagram {
    from: Vec<String>,
    to: Vec<String>,
    counts: Vec<i64>,
    states: Vec<String>,
    tprob: Array2<Real>,
    n_runs: usize,
}

impl ModelDiagram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a whitespace-separated transition file with quoted state
    /// labels: `step "from" "to" count`, header row first.
    pub fn read_transitions(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b' ')
            .has_headers(true)
            .from_reader(file);

        for (i, record) in reader.records().enumerate() {
            let record = record.map_err(|e| {
                Error::invalid(format!("{}: row {}: {}", path.display(), i + 1, e))
            })?;
            if record.len() < 4 {
                return Err(Error::invalid(format!(
                    "{}: row {}: expected `step from to count`, got {} fields",
                    path.display(),
                    i + 1,
                    record.len()
                )));
            }
            let count: i64 = record[3].parse().map_err(|_| {
                Error::invalid(format!(
                    "{}: row {}: invalid count {:?}",
                    path.display(),
                    i + 1,
                    &record[3]
                ))
            })?;
            self.from.push(record[1].to_string());
            self.to.push(record[2].to_string());
            self.counts.push(count);
        }

        self.n_runs += 1;
        Ok(self)
    }

    /// Concatenate several transition files (e.g. from `run_multiple`).
    pub fn read_transitions_many<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<&mut Self> {
        for path in paths {
            self.read_transitions(path)?;
        }
        Ok(self)
    }

    pub fn n_runs(&self) -> usize {
        self.n_runs
    }

    /// Collapse the accumulated rows into a matrix over the observed
    /// state set (sorted by label). With `normalize`, rows become
    /// probabilities (row-stochastic where the row has any mass).
    pub fn transition_probability(&mut self, normalize: bool) -> Result<&Array2<Real>> {
        if self.counts.is_empty() {
            return Err(Error::invalid("no transitions were read"));
        }

        let mut state_set = BTreeSet::new();
        let mut cells: BTreeMap<(String, String), i64> = BTreeMap::new();
        for i in 0..self.counts.len() {
            state_set.insert(self.from[i].clone());
            state_set.insert(self.to[i].clone());
            *cells
                .entry((self.from[i].clone(), self.to[i].clone()))
                .or_insert(0) += self.counts[i];
        }

        self.states = state_set.into_iter().collect();
        let n = self.states.len();
        let mut matrix = Array2::zeros((n, n));
        for (i, from) in self.states.iter().enumerate() {
            for (j, to) in self.states.iter().enumerate() {
                if let Some(&c) = cells.get(&(from.clone(), to.clone())) {
                    matrix[[i, j]] = c as Real;
                }
            }
        }

        if normalize {
            for mut row in matrix.rows_mut() {
                let total: Real = row.sum();
                if total > 0.0 {
                    row.mapv_inplace(|x| x / total);
                }
            }
        }

        self.tprob = matrix;
        Ok(&self.tprob)
    }

    /// State labels in matrix order; empty before
    /// [`ModelDiagram::transition_probability`] runs.
    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn tprob(&self) -> &Array2<Real> {
        &self.tprob
    }

    /// Render the current matrix as a Mermaid `flowchart LR` block.
    /// Self-transitions are skipped unless `self_loops`.
    pub fn to_mermaid(&self, self_loops: bool) -> String {
        let mut out = String::from("flowchart LR\n");
        for (i, label) in self.states.iter().enumerate() {
            out.push_str(&format!("    s{}[{}]\n", i, label));
        }
        for i in 0..self.states.len() {
            for j in 0..self.states.len() {
                if i == j && !self_loops {
                    continue;
                }
                let p = self.tprob[[i, j]];
                if p > 0.0 {
                    out.push_str(&format!("    s{} -->|{:.2}| s{}\n", i, p, j));
                }
            }
        }
        out
    }

    /// Read `fn_transition`, compute probabilities and write (or return)
    /// the Mermaid rendering.
    pub fn draw(
        &mut self,
        fn_transition: impl AsRef<Path>,
        output: Option<&Path>,
        self_loops: bool,
    ) -> Result<String> {
        self.read_transitions(fn_transition)?;
        self.transition_probability(true)?;
        let graph = self.to_mermaid(self_loops);
        if let Some(path) = output {
            let mut file = File::create(path)?;
            file.write_all(graph.as_bytes())?;
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use std::io::Write;

    fn transition_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "date from to counts").unwrap();
        writeln!(f, "0 \"susceptible\" \"susceptible\" 90").unwrap();
        writeln!(f, "0 \"susceptible\" \"exposed\" 10").unwrap();
        writeln!(f, "1 \"exposed\" \"removed\" 5").unwrap();
        writeln!(f, "1 \"susceptible\" \"exposed\" 10").unwrap();
        f
    }

    #[test]
    fn aggregates_and_normalizes() {
        let f = transition_file();
        let mut diagram = ModelDiagram::new();
        diagram.read_transitions(f.path()).unwrap();
        let tprob = diagram.transition_probability(true).unwrap().clone();

        // Sorted state set: exposed, removed, susceptible.
        assert_eq!(diagram.states(), &["exposed", "removed", "susceptible"]);
        let s = 2;
        assert_approx_eq!(tprob[[s, 0]], 20.0 / 110.0, 1e-12);
        assert_approx_eq!(tprob[[s, s]], 90.0 / 110.0, 1e-12);
        assert_approx_eq!(tprob[[0, 1]], 1.0, 1e-12);
        assert_eq!(diagram.n_runs(), 1);
    }

    #[test]
    fn mermaid_output() {
        let f = transition_file();
        let mut diagram = ModelDiagram::new();
        let graph = diagram.draw(f.path(), None, false).unwrap();
        assert!(graph.starts_with("flowchart LR"));
        assert!(graph.contains("s2[susceptible]"));
        assert!(graph.contains("-->"));
        // No self loops requested.
        assert!(!graph.contains("s2 -->|0.82| s2"));
    }

    #[test]
    fn missing_file_is_io_failure() {
        let mut diagram = ModelDiagram::new();
        assert!(matches!(
            diagram.read_transitions("/no/such/file"),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn empty_diagram_has_no_matrix() {
        let mut diagram = ModelDiagram::new();
        assert!(diagram.transition_probability(true).is_err());
    }
}
