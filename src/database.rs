use crate::agent::Agent;
use crate::error::{Error, Result};
use crate::prelude::{AgentIdx, Day, StateCode, VariantId};
use crate::userdata::UserData;
use crate::virus::Virus;
use getset::CopyGetters;
use log::*;
use ndarray::Array2;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::hash::Hasher;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

/// Caller-supplied hashing and rendering of the opaque sequence payload.
/// The engine never interprets the bytes itself.
#[derive(Clone)]
pub struct SeqCodec {
    pub hash: Arc<dyn Fn(&[u8]) -> u64 + Send + Sync>,
    pub write: Arc<dyn Fn(&[u8]) -> String + Send + Sync>,
}

impl Default for SeqCodec {
    fn default() -> Self {
        SeqCodec {
            hash: Arc::new(|seq| {
                let mut h = DefaultHasher::new();
                h.write(seq);
                h.finish()
            }),
            write: Arc::new(|seq| {
                seq.iter().map(|b| format!("{:02x}", b)).collect::<String>()
            }),
        }
    }
}

impl fmt::Debug for SeqCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SeqCodec {..}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transmission {
    pub day: Day,
    pub variant: VariantId,
    pub source: AgentIdx,
    pub target: AgentIdx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TotalHistRow {
    pub day: Day,
    pub n_variants: usize,
    pub state: StateCode,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VariantHistRow {
    pub day: Day,
    pub variant: VariantId,
    pub state: StateCode,
    pub count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionRow {
    pub day: Day,
    pub from: StateCode,
    pub to: StateCode,
    pub count: i64,
}

/// Bookkeeping for a run: variant genealogy, per-state daily totals with
/// their pending-next buffers, the state-transition matrix, the
/// transmission log and the sampled history tables.
#[derive(Debug, Clone, Default, CopyGetters)]
pub struct Database {
    n_states: usize,
    state_labels: Vec<String>,

    #[getset(get_copy = "pub")]
    population_size: usize,

    /// Snapshot cadence in days; history rows are appended when
    /// `day % sampling_freq == 0`.
    #[getset(get_copy = "pub")]
    sampling_freq: Day,

    codec: SeqCodecSlot,

    // Variant registry; the sequence hash is the key.
    variant_ids: HashMap<u64, VariantId>,
    sequences: Vec<Option<Vec<u8>>>,
    origin_dates: Vec<Day>,
    parents: Vec<Option<VariantId>>,
    patients: Vec<Option<AgentIdx>>,

    #[getset(get_copy = "pub")]
    n_variants_active: usize,

    today_total: Vec<i64>,
    today_total_next: Vec<i64>,
    today_variant: Vec<Vec<i64>>,
    today_variant_next: Vec<Vec<i64>>,
    transition: Array2<i64>,
    transition_next: Array2<i64>,

    hist_total: Vec<TotalHistRow>,
    hist_variant: Vec<VariantHistRow>,
    hist_transition: Vec<TransitionRow>,
    transmissions: Vec<Transmission>,

    user_data: UserData,
}

// Keeps `Database: Default` while SeqCodec carries closures.
#[derive(Debug, Clone, Default)]
struct SeqCodecSlot(Option<SeqCodec>);

impl SeqCodecSlot {
    fn get(&self) -> SeqCodec {
        self.0.clone().unwrap_or_default()
    }
}

impl Database {
    pub fn new(sampling_freq: Day) -> Self {
        Database {
            sampling_freq: sampling_freq.max(1),
            ..Default::default()
        }
    }

    pub fn set_seq_codec(&mut self, codec: SeqCodec) {
        self.codec = SeqCodecSlot(Some(codec));
    }

    pub fn set_sampling_freq(&mut self, freq: Day) {
        self.sampling_freq = freq.max(1);
    }

    /// Wipe everything recorded and re-size the counters against the
    /// model's states and population, counting each agent at its current
    /// state.
    pub(crate) fn sync(&mut self, labels: &[String], population: &[Agent]) {
        self.clear_history();
        self.n_states = labels.len();
        self.state_labels = labels.to_vec();
        self.population_size = population.len();

        self.today_total = vec![0; self.n_states];
        self.today_total_next = vec![0; self.n_states];
        self.transition = Array2::zeros((self.n_states, self.n_states));
        self.transition_next = Array2::zeros((self.n_states, self.n_states));

        for agent in population {
            self.today_total[agent.state()] += 1;
        }
    }

    fn clear_history(&mut self) {
        self.variant_ids.clear();
        self.sequences.clear();
        self.origin_dates.clear();
        self.parents.clear();
        self.patients.clear();
        self.n_variants_active = 0;
        self.today_variant.clear();
        self.today_variant_next.clear();
        self.hist_total.clear();
        self.hist_variant.clear();
        self.hist_transition.clear();
        self.transmissions.clear();
        self.user_data.clear();
    }

    pub fn n_states(&self) -> usize {
        self.n_states
    }

    pub fn n_variants(&self) -> usize {
        self.sequences.len()
    }

    /// Register (or re-identify) the variant carried by `virus`. New
    /// sequences get a fresh id with today's origin date and the virus's
    /// previous id as parent; known sequences reassign id and date. When
    /// the registration comes from a live infection, the host's count
    /// moves from the old variant to the new one in the pending-next
    /// counters.
    pub fn record_variant(
        &mut self,
        virus: &mut Virus,
        host_state: Option<StateCode>,
        day: Day,
    ) -> Result<VariantId> {
        let old_id = virus.id();
        // Sequence-less viruses key on their name so that two distinct
        // prototypes do not collapse into one variant.
        let codec = self.codec.get();
        let hash = match virus.seq() {
            Some(seq) => (codec.hash)(seq),
            None => (codec.hash)(virus.name().as_bytes()),
        };

        let new_id = match self.variant_ids.get(&hash) {
            Some(&id) => {
                virus.set_id(id);
                virus.set_date(self.origin_dates[id]);
                id
            }
            None => {
                let id = self.sequences.len();
                self.variant_ids.insert(hash, id);
                self.sequences.push(virus.seq().map(|s| s.to_vec()));
                self.origin_dates.push(day);
                self.parents.push(old_id);
                self.patients.push(virus.host());
                self.today_variant.push(vec![0; self.n_states]);
                self.today_variant_next.push(vec![0; self.n_states]);
                self.n_variants_active += 1;
                virus.set_id(id);
                virus.set_date(day);
                trace!("variant {} registered on day {}", id, day);
                id
            }
        };

        if let (Some(old), Some(state)) = (old_id, host_state) {
            if old != new_id {
                self.variant_delta(old, state, -1)?;
                self.variant_delta(new_id, state, 1)?;
            }
        }

        Ok(new_id)
    }

    /// Buffer a per-variant count change at `state`.
    pub(crate) fn variant_delta(
        &mut self,
        variant: VariantId,
        state: StateCode,
        delta: i64,
    ) -> Result<()> {
        let row = self.today_variant_next.get_mut(variant).ok_or_else(|| {
            Error::unknown(format!("variant {} not in the registry", variant))
        })?;
        let cell = row
            .get_mut(state)
            .ok_or_else(|| Error::out_of_range(format!("state code {}", state)))?;
        *cell += delta;
        Ok(())
    }

    /// Buffer an agent-level state change: totals plus one transition
    /// matrix cell.
    pub(crate) fn update_state(&mut self, prev: StateCode, new: StateCode) {
        self.today_total_next[prev] -= 1;
        self.today_total_next[new] += 1;
        self.transition_next[[prev, new]] += 1;
    }

    pub(crate) fn record_transmission(
        &mut self,
        day: Day,
        variant: VariantId,
        source: AgentIdx,
        target: AgentIdx,
    ) {
        self.transmissions.push(Transmission {
            day,
            variant,
            source,
            target,
        });
    }

    /// Commit the pending-next buffers and, on sampling days, append the
    /// history snapshot. The transition matrix accumulates between
    /// snapshots and is zeroed after each one.
    pub(crate) fn record_day(&mut self, day: Day) {
        for (total, next) in self.today_total.iter_mut().zip(&mut self.today_total_next) {
            *total += *next;
            *next = 0;
        }
        for (row, next_row) in self.today_variant.iter_mut().zip(&mut self.today_variant_next) {
            for (cell, next) in row.iter_mut().zip(next_row.iter_mut()) {
                *cell += *next;
                *next = 0;
            }
        }
        self.transition += &self.transition_next;
        self.transition_next.fill(0);

        debug_assert_eq!(
            self.today_total.iter().sum::<i64>(),
            self.population_size as i64,
            "per-state totals must add up to the population"
        );
        debug_assert!(
            self.today_variant.iter().flatten().all(|&c| c >= 0),
            "variant counts must stay non-negative"
        );

        if day % self.sampling_freq == 0 {
            self.snapshot(day);
            self.transition.fill(0);
        }
    }

    fn snapshot(&mut self, day: Day) {
        for (variant, row) in self.today_variant.iter().enumerate() {
            for (state, &count) in row.iter().enumerate() {
                self.hist_variant.push(VariantHistRow {
                    day,
                    variant,
                    state,
                    count,
                });
            }
        }
        for (state, &count) in self.today_total.iter().enumerate() {
            self.hist_total.push(TotalHistRow {
                day,
                n_variants: self.n_variants_active,
                state,
                count,
            });
        }
        for from in 0..self.n_states {
            for to in 0..self.n_states {
                self.hist_transition.push(TransitionRow {
                    day,
                    from,
                    to,
                    count: self.transition[[from, to]],
                });
            }
        }
    }

    pub fn today_total(&self, state: StateCode) -> i64 {
        self.today_total.get(state).copied().unwrap_or(0)
    }

    pub fn today_totals(&self) -> &[i64] {
        &self.today_total
    }

    pub fn today_variant(&self, variant: VariantId, state: StateCode) -> i64 {
        self.today_variant
            .get(variant)
            .and_then(|row| row.get(state))
            .copied()
            .unwrap_or(0)
    }

    pub fn hist_total(&self) -> &[TotalHistRow] {
        &self.hist_total
    }

    pub fn hist_variant(&self) -> &[VariantHistRow] {
        &self.hist_variant
    }

    pub fn hist_transition(&self) -> &[TransitionRow] {
        &self.hist_transition
    }

    pub fn transmissions(&self) -> &[Transmission] {
        &self.transmissions
    }

    pub fn variant_origin(&self, variant: VariantId) -> Option<Day> {
        self.origin_dates.get(variant).copied()
    }

    pub fn variant_parent(&self, variant: VariantId) -> Option<Option<VariantId>> {
        self.parents.get(variant).copied()
    }

    pub fn state_label(&self, state: StateCode) -> &str {
        self.state_labels
            .get(state)
            .map(|s| s.as_str())
            .unwrap_or("?")
    }

    pub fn user_data(&self) -> &UserData {
        &self.user_data
    }

    pub(crate) fn user_data_mut(&mut self) -> &mut UserData {
        &mut self.user_data
    }

    /* CSV-like writers (space separated, header row first) *************/

    /// `id sequence date parent patient`
    pub fn write_variant_info(&self, path: impl AsRef<Path>) -> Result<()> {
        let render = self.codec.get().write;
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "id sequence date parent patient")?;
        for id in 0..self.sequences.len() {
            let seq = match &self.sequences[id] {
                Some(seq) => render(seq),
                None => String::new(),
            };
            writeln!(
                w,
                "{} {} {} {} {}",
                id,
                seq,
                self.origin_dates[id],
                self.parents[id].map(|p| p as i64).unwrap_or(-1),
                self.patients[id].map(|p| p as i64).unwrap_or(-1),
            )?;
        }
        Ok(())
    }

    /// `date id status n`
    pub fn write_variant_hist(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "date id status n")?;
        for row in &self.hist_variant {
            writeln!(
                w,
                "{} {} \"{}\" {}",
                row.day,
                row.variant,
                self.state_label(row.state),
                row.count
            )?;
        }
        Ok(())
    }

    /// `date nvariants status counts`
    pub fn write_total_hist(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "date nvariants status counts")?;
        for row in &self.hist_total {
            writeln!(
                w,
                "{} {} \"{}\" {}",
                row.day,
                row.n_variants,
                self.state_label(row.state),
                row.count
            )?;
        }
        Ok(())
    }

    /// `date variant source target`
    pub fn write_transmissions(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "date variant source target")?;
        for t in &self.transmissions {
            writeln!(w, "{} {} {} {}", t.day, t.variant, t.source, t.target)?;
        }
        Ok(())
    }

    /// `date from to counts` - one row per (day, from, to) matrix cell.
    pub fn write_transitions(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "date from to counts")?;
        for row in &self.hist_transition {
            writeln!(
                w,
                "{} \"{}\" \"{}\" {}",
                row.day,
                self.state_label(row.from),
                self.state_label(row.to),
                row.count
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_states(labels: &[&str], pop: usize) -> Database {
        let mut db = Database::new(1);
        let labels: Vec<String> = labels.iter().map(|s| s.to_string()).collect();
        let population: Vec<Agent> = (0..pop).map(Agent::new).collect();
        db.sync(&labels, &population);
        db
    }

    #[test]
    fn sync_counts_initial_states() {
        let db = db_with_states(&["s", "e", "r"], 5);
        assert_eq!(db.today_total(0), 5);
        assert_eq!(db.today_total(1), 0);
        assert_eq!(db.population_size(), 5);
    }

    #[test]
    fn record_variant_assigns_dense_ids() {
        let mut db = db_with_states(&["s", "e", "r"], 3);
        let mut a = Virus::new("a");
        let mut b = Virus::new("b");
        assert_eq!(db.record_variant(&mut a, None, 0).unwrap(), 0);
        assert_eq!(db.record_variant(&mut b, None, 0).unwrap(), 1);
        // Same name, no sequence: same variant.
        let mut a2 = Virus::new("a");
        assert_eq!(db.record_variant(&mut a2, None, 4).unwrap(), 0);
        assert_eq!(a2.date(), 0, "known variants keep their origin date");
        assert_eq!(db.n_variants(), 2);
    }

    #[test]
    fn mutation_moves_host_count() {
        let mut db = db_with_states(&["s", "e", "r"], 3);
        let mut v = Virus::new("x");
        db.record_variant(&mut v, None, 0).unwrap();
        db.variant_delta(0, 1, 1).unwrap();
        db.record_day(0);
        assert_eq!(db.today_variant(0, 1), 1);

        // The host mutates into a new sequence on day 2.
        v.set_host(Some(0));
        v.set_seq(vec![1, 2, 3]);
        let new_id = db.record_variant(&mut v, Some(1), 2).unwrap();
        assert_eq!(new_id, 1);
        db.record_day(1);
        db.record_day(2);
        assert_eq!(db.today_variant(0, 1), 0);
        assert_eq!(db.today_variant(1, 1), 1);
        assert_eq!(db.variant_parent(1), Some(Some(0)));
        assert_eq!(db.variant_origin(1), Some(2));
    }

    #[test]
    fn state_change_commits_on_record_day() {
        let mut db = db_with_states(&["s", "e", "r"], 4);
        db.update_state(0, 1);
        db.update_state(0, 1);
        assert_eq!(db.today_total(1), 0, "next buffers are invisible");
        db.record_day(0);
        assert_eq!(db.today_total(0), 2);
        assert_eq!(db.today_total(1), 2);
        let row = &db.hist_total()[0];
        assert_eq!(row.day, 0);
    }

    #[test]
    fn transitions_accumulate_until_snapshot() {
        let mut db = db_with_states(&["s", "e", "r"], 4);
        db.set_sampling_freq(2);
        db.update_state(0, 1);
        db.record_day(0); // snapshot day (0 % 2 == 0), then zeroed
        db.update_state(1, 2);
        db.record_day(1); // no snapshot
        db.update_state(1, 2);
        db.record_day(2); // snapshot carries both 1->2 transitions
        let rows: Vec<_> = db
            .hist_transition()
            .iter()
            .filter(|r| r.day == 2 && r.from == 1 && r.to == 2)
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 2);
    }

    #[test]
    fn writers_emit_headers() {
        let mut db = db_with_states(&["s", "e", "r"], 2);
        let mut v = Virus::new("x");
        db.record_variant(&mut v, None, 0).unwrap();
        db.record_transmission(0, 0, 0, 1);
        db.record_day(0);

        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("total.txt");
        db.write_total_hist(&p).unwrap();
        let text = std::fs::read_to_string(&p).unwrap();
        assert!(text.starts_with("date nvariants status counts\n"));
        assert!(text.contains("0 1 \"s\" 2"));

        let p = dir.path().join("vinfo.txt");
        db.write_variant_info(&p).unwrap();
        let text = std::fs::read_to_string(&p).unwrap();
        assert!(text.starts_with("id sequence date parent patient\n"));
        assert!(text.contains("0  0 -1 -1"));
    }
}
