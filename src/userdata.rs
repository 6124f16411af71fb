use crate::error::{Error, Result};
use crate::prelude::{Day, Real};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Append-only, time-indexed user columns. Rows are keyed by the day they
/// were recorded on; cells may be filled one at a time or a full row at
/// once.
#[derive(Debug, Clone, Default)]
pub struct UserData {
    names: Vec<String>,
    dates: Vec<Day>,
    data: Vec<Real>,
    last_day: Day,
}

impl UserData {
    pub fn new(names: Vec<String>) -> Self {
        UserData {
            names,
            dates: Vec::new(),
            data: Vec::new(),
            last_day: -1,
        }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn ncol(&self) -> usize {
        self.names.len()
    }

    pub fn nrow(&self) -> usize {
        self.dates.len()
    }

    pub fn dates(&self) -> &[Day] {
        &self.dates
    }

    pub(crate) fn clear(&mut self) {
        self.dates.clear();
        self.data.clear();
        self.last_day = -1;
    }

    /// Append a full row for `day`.
    pub fn add_row(&mut self, day: Day, row: &[Real]) -> Result<()> {
        if self.names.is_empty() {
            return Err(Error::invalid("user data columns were never declared"));
        }
        if row.len() != self.ncol() {
            return Err(Error::invalid(format!(
                "expected {} user data values, got {}",
                self.ncol(),
                row.len()
            )));
        }
        self.dates.push(day);
        self.data.extend_from_slice(row);
        self.last_day = day;
        Ok(())
    }

    /// Set one cell of the row for `day`, creating the row (zero filled)
    /// if this is the first write for that day.
    pub fn add_cell(&mut self, day: Day, col: usize, value: Real) -> Result<()> {
        if col >= self.ncol() {
            return Err(Error::out_of_range(format!(
                "user data column {} (have {})",
                col,
                self.ncol()
            )));
        }
        if self.last_day != day || self.dates.is_empty() {
            self.dates.push(day);
            self.data.resize(self.data.len() + self.ncol(), 0.0);
            self.last_day = day;
        }
        let row0 = (self.nrow() - 1) * self.ncol();
        self.data[row0 + col] = value;
        Ok(())
    }

    pub fn get(&self, row: usize, col: usize) -> Result<Real> {
        if row >= self.nrow() || col >= self.ncol() {
            return Err(Error::out_of_range(format!(
                "user data cell ({}, {}) of a {}x{} table",
                row,
                col,
                self.nrow(),
                self.ncol()
            )));
        }
        Ok(self.data[row * self.ncol() + col])
    }

    pub fn get_by_name(&self, row: usize, name: &str) -> Result<Real> {
        let col = self
            .names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::unknown(format!("user data column {:?}", name)))?;
        self.get(row, col)
    }

    /// Space-separated table: `date <names...>`.
    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        write!(w, "date")?;
        for name in &self.names {
            write!(w, " {}", name)?;
        }
        writeln!(w)?;
        for (i, date) in self.dates.iter().enumerate() {
            write!(w, "{}", date)?;
            for j in 0..self.ncol() {
                write!(w, " {}", self.data[i * self.ncol() + j])?;
            }
            writeln!(w)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_and_cells() {
        let mut ud = UserData::new(vec!["a".into(), "b".into()]);
        ud.add_row(0, &[1.0, 2.0]).unwrap();
        ud.add_cell(1, 0, 3.0).unwrap();
        ud.add_cell(1, 1, 4.0).unwrap();
        assert_eq!(ud.nrow(), 2);
        assert_eq!(ud.get(0, 1).unwrap(), 2.0);
        assert_eq!(ud.get(1, 0).unwrap(), 3.0);
        assert_eq!(ud.get_by_name(1, "b").unwrap(), 4.0);
    }

    #[test]
    fn shape_errors() {
        let mut ud = UserData::new(vec!["a".into()]);
        assert!(ud.add_row(0, &[1.0, 2.0]).is_err());
        assert!(ud.add_cell(0, 3, 1.0).is_err());
        assert!(ud.get(0, 0).is_err());
        assert!(ud.get_by_name(0, "zzz").is_err());
    }

    #[test]
    fn write_table() {
        let mut ud = UserData::new(vec!["cases".into()]);
        ud.add_row(0, &[10.0]).unwrap();
        ud.add_row(1, &[12.5]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("user.txt");
        ud.write(&p).unwrap();
        let text = std::fs::read_to_string(&p).unwrap();
        assert_eq!(text, "date cases\n0 10\n1 12.5\n");
    }
}
