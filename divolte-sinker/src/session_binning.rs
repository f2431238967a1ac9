use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Datelike, Local, NaiveTime};
use likely_stable::unlikely;
use log::{debug, info, warn};

use divolte_core::clock::{SystemClock, TimeSource};
use divolte_core::record::AppendRecord;
use divolte_core::tool::find_local_host_name;

use crate::config::SessionBinningConfig;
use crate::container::ContainerWriter;
use crate::flusher::{FileFlushStrategy, FlushResult};
use crate::remote_fs::{RemoteFileSystem, RemoteStream};

/// How long a round file stays open, in units of the session length: one
/// for the round itself, two of headroom for late events from sessions
/// that started near the end of the round.
const FILE_TTL_IN_SESSION_DURATIONS: u64 = 3;

/// Minimum wall-clock pause between reconnect attempts after a remote
/// failure.
const RECONNECT_DELAY_MS: u64 = 15_000;

/// Disambiguates sinks within one process. The host name in the file name
/// covers disambiguation between collector instances.
static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(0);

/// One open output file accepting records for a round.
struct RoundFile<S: RemoteStream> {
    /// Identity of the file within the sink, stable across arena moves.
    id: u64,

    /// The round this file was opened for, after TTL clamping.
    round: u64,

    path: PathBuf,

    writer: ContainerWriter<S>,

    /// Wall clock of the last durable sync, or of creation.
    last_sync_time_ms: u64,

    records_since_last_sync: u32,
}

/// Best-effort session binning over round files.
///
/// Each timestamp maps to a round, `timestamp / session_timeout`, and each
/// round gets its own file. A record lands in the file of the round its
/// session started in; a file outlives its round by two extra session
/// lengths to catch late events. A file that was opened, flushed and
/// closed without intermediate remote failure fully contains every
/// session that started within it and lasted less than the session
/// timeout.
///
/// Record event times drive the logical clock for all rotation decisions.
/// The wall clock only paces sync staleness and reconnect attempts.
pub struct SessionBinningSink<F: RemoteFileSystem> {
    fs: F,
    config: SessionBinningConfig,
    clock: Arc<dyn TimeSource>,

    host: String,
    instance_number: u32,

    /// Arena of open files. Slots move on removal; `RoundFile::id` is the
    /// stable identity.
    files: Vec<RoundFile<F::Stream>>,

    /// Round to arena slot. Several rounds may point at the same slot
    /// when long sessions overflow into the oldest open file.
    rounds: HashMap<u64, usize>,

    next_file_id: u64,

    alive: bool,

    /// Round whose failure caused the current outage; the reconnect
    /// target.
    failed_round: Option<u64>,

    last_fix_attempt_ms: u64,

    /// Logical clock: the latest record event time, or the wall clock
    /// when the queue was last seen empty.
    time_signal_ms: u64,
}

impl<F: RemoteFileSystem> SessionBinningSink<F> {
    pub fn new(fs: F, config: SessionBinningConfig) -> Self {
        Self::with_clock(fs, config, Arc::new(SystemClock))
    }

    pub fn with_clock(fs: F, config: SessionBinningConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            fs,
            config,
            clock,
            host: find_local_host_name(),
            instance_number: INSTANCE_COUNTER.fetch_add(1, Ordering::SeqCst) + 1,
            files: Vec::new(),
            rounds: HashMap::new(),
            next_file_id: 0,
            alive: false,
            failed_round: None,
            last_fix_attempt_ms: 0,
            time_signal_ms: 0,
        }
    }

    /// Rounds currently mapped to an open file, in ascending order.
    /// Aliased rounds show up alongside the rounds files were opened for.
    pub fn open_rounds(&self) -> Vec<u64> {
        let mut rounds: Vec<u64> = self.rounds.keys().copied().collect();
        rounds.sort_unstable();
        rounds
    }

    /// Effective rounds of the distinct open files, in ascending order.
    pub fn open_file_rounds(&self) -> Vec<u64> {
        let mut rounds: Vec<u64> = self.files.iter().map(|file| file.round).collect();
        rounds.sort_unstable();
        rounds
    }

    /// Number of distinct open files.
    pub fn open_file_count(&self) -> usize {
        self.files.len()
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn failed_round(&self) -> Option<u64> {
        self.failed_round
    }

    fn session_timeout_ms(&self) -> u64 {
        self.config.session_timeout_ms()
    }

    /// Oldest round a file may still be open for under the TTL, given the
    /// current logical time.
    fn oldest_allowed_round(&self) -> u64 {
        (self.time_signal_ms / self.session_timeout_ms())
            .saturating_sub(FILE_TTL_IN_SESSION_DURATIONS - 1)
    }

    fn slot_of(&self, file_id: u64) -> Option<usize> {
        self.files.iter().position(|file| file.id == file_id)
    }

    fn write_record(&mut self, record: &AppendRecord) -> FlushResult {
        match self.append_to_round_file(record) {
            Ok(()) => FlushResult::Success,
            Err(e) => {
                warn!("error while flushing event to the remote file system, error: {:#}", e);
                self.failed_round =
                    Some(record.session_id().timestamp / self.session_timeout_ms());
                self.remote_died();
                FlushResult::Failure
            }
        }
    }

    fn append_to_round_file(&mut self, record: &AppendRecord) -> Result<()> {
        let slot = self.file_for_session_start(record.session_id().timestamp)?;

        let file = &mut self.files[slot];
        file.writer.append_encoded(record.bytes());
        file.records_since_last_sync += 1;
        let file_id = file.id;

        self.possibly_sync_and_close(file_id)
    }

    /// Resolve the open file that takes events of a session started at
    /// `session_start_ms`, aliasing or creating as needed.
    fn file_for_session_start(&mut self, session_start_ms: u64) -> Result<usize> {
        let requested = session_start_ms / self.session_timeout_ms();

        if let Some(&slot) = self.rounds.get(&requested) {
            return Ok(slot);
        }

        // The requested round is not open. An exceptionally long session
        // whose round has already closed falls into the oldest file that
        // is still open.
        let alias = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, file)| file.round >= requested)
            .min_by_key(|(_, file)| file.round)
            .map(|(slot, _)| slot);

        let slot = match alias {
            Some(slot) => slot,
            None => self.open_round_file(session_start_ms)?,
        };

        self.rounds.insert(requested, slot);

        Ok(slot)
    }

    /// Open a new round file for an event at `time_ms`. Requests for
    /// rounds older than the TTL window are clamped into the oldest round
    /// still permitted, instead of reopening ancient buckets.
    fn open_round_file(&mut self, time_ms: u64) -> Result<usize> {
        let requested = time_ms / self.session_timeout_ms();
        let round = requested.max(self.oldest_allowed_round());

        let path = self.config.dir.join(self.file_name(round)?);

        let stream = self.fs.create(&path, self.config.replication)?;

        // The remote side may accept the create while no storage node can
        // actually persist data; probe durability right away and clean up
        // the file on failure.
        let opened = ContainerWriter::new(stream, &self.config.schema_json)
            .and_then(|mut writer| writer.hsync().map(|()| writer));

        let writer = match opened {
            Ok(writer) => writer,
            Err(e) => {
                warn!("failed remote file creation: {}", path.display());
                if let Err(delete_err) = self.fs.delete(&path) {
                    debug!(
                        "could not delete file after failed creation, path: {}, error: {:#}",
                        path.display(),
                        delete_err
                    );
                }
                return Err(e);
            }
        };

        let file = RoundFile {
            id: self.next_file_id,
            round,
            path,
            writer,
            last_sync_time_ms: self.clock.now_ms(),
            records_since_last_sync: 0,
        };
        self.next_file_id += 1;

        debug!("created new remote file: {}", file.path.display());

        self.files.push(file);

        Ok(self.files.len() - 1)
    }

    /// Evaluate the sync policy for one file, then rotate it out if its
    /// round fell behind the TTL window. The file may already be gone by
    /// the time a heartbeat snapshot gets here; that is not an error.
    fn possibly_sync_and_close(&mut self, file_id: u64) -> Result<()> {
        let slot = match self.slot_of(file_id) {
            Some(slot) => slot,
            None => return Ok(()),
        };

        let wall_now = self.clock.now_ms();
        let sync_records = self.config.sync_file_after_records;
        let sync_age_ms = self.config.sync_file_after_ms();

        let file = &mut self.files[slot];

        let sync_by_count = file.records_since_last_sync >= sync_records;
        let sync_by_age = file.records_since_last_sync > 0
            && wall_now.saturating_sub(file.last_sync_time_ms) >= sync_age_ms;

        if sync_by_count || sync_by_age {
            debug!("syncing file: {}", file.path.display());

            // A container block boundary first, then the durability
            // barrier on the stream underneath.
            file.writer.sync()?;
            file.writer.hsync()?;

            file.records_since_last_sync = 0;
            file.last_sync_time_ms = wall_now;

            self.possibly_close(slot);
        } else if file.records_since_last_sync == 0 {
            // Keep the sync age of an idle file fresh, so a burst after a
            // quiet period does not trigger an immediate sync.
            file.last_sync_time_ms = wall_now;

            self.possibly_close(slot);
        }

        Ok(())
    }

    /// Close and remove the file in `slot` once its round falls out of
    /// the TTL window, along with every round aliased to it.
    fn possibly_close(&mut self, slot: usize) {
        if self.files[slot].round >= self.oldest_allowed_round() {
            return;
        }

        let file = &mut self.files[slot];
        debug!("closing file: {}", file.path.display());

        if let Err(e) = file.writer.close() {
            warn!(
                "failed to cleanly close file, path: {}, error: {:#}",
                file.path.display(),
                e
            );
        }

        self.remove_slot(slot);
    }

    /// Drop a file from the arena, fixing up the slot of the entry that
    /// `swap_remove` moves into its place.
    fn remove_slot(&mut self, slot: usize) {
        self.rounds.retain(|_, s| *s != slot);

        let moved = self.files.len() - 1;
        self.files.swap_remove(slot);

        if slot != moved {
            for s in self.rounds.values_mut() {
                if *s == moved {
                    *s = slot;
                }
            }
        }
    }

    /// Evaluate the sync policy for every distinct open file, over a
    /// snapshot: the evaluation itself closes and removes files.
    fn sync_open_files(&mut self) -> Result<()> {
        let snapshot: Vec<(u64, u64)> = self
            .files
            .iter()
            .map(|file| (file.id, file.round))
            .collect();

        for (file_id, round) in snapshot {
            if let Err(e) = self.possibly_sync_and_close(file_id) {
                self.failed_round = Some(round);
                return Err(e);
            }
        }

        Ok(())
    }

    /// Abandon everything and enter the reconnect cycle. Files closed on
    /// this path lose the session-containment guarantee.
    fn remote_died(&mut self) {
        self.alive = false;
        self.last_fix_attempt_ms = self.clock.now_ms();

        for file in &mut self.files {
            if let Err(e) = file.writer.close() {
                debug!(
                    "ignoring close failure during teardown, path: {}, error: {:#}",
                    file.path.display(),
                    e
                );
            }
        }
        self.files.clear();
        self.rounds.clear();

        warn!("remote file system failure, closing all files and going into reconnect cycle");
    }

    /// Reconnect by recreating a file for the round that caused the
    /// failure. Other rounds are recreated as their records arrive.
    fn possibly_fix_connection(&mut self) -> FlushResult {
        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_fix_attempt_ms) < RECONNECT_DELAY_MS {
            return FlushResult::Failure;
        }

        let failed_round = match self.failed_round {
            Some(round) => round,
            None => return FlushResult::Failure,
        };

        match self.open_round_file(failed_round * self.session_timeout_ms()) {
            Ok(slot) => {
                self.rounds.insert(failed_round, slot);
                self.alive = true;
                self.failed_round = None;
                self.last_fix_attempt_ms = 0;
                info!("recovered remote file system connection");
                FlushResult::Success
            }
            Err(e) => {
                warn!(
                    "could not reconnect to the remote file system after failure, error: {:#}",
                    e
                );
                self.last_fix_attempt_ms = now;
                FlushResult::Failure
            }
        }
    }

    /// File name: host, round tag, wall-clock creation time, per-process
    /// instance number. The creation time disambiguates rapid reopenings
    /// of one round after failures; the instance number disambiguates
    /// multiple sinks in one process.
    fn file_name(&self, round: u64) -> Result<String> {
        let creation = local_date_time(self.clock.now_ms())?;

        Ok(format!(
            "{}-divolte-tracking-{}-{}-{}.avro",
            self.host,
            self.round_tag(round)?,
            creation.format("%H.%M.%S%.3f"),
            self.instance_number
        ))
    }

    /// Round tag `YYYYMMDD-RR`: the local date of the round start plus the
    /// zero-padded number of full session-length intervals since local
    /// midnight of that date. On days with a DST transition the number of
    /// intervals in the day is not integral; the tag still comes from
    /// plain integer division.
    fn round_tag(&self, round: u64) -> Result<String> {
        let round_start_ms = round * self.session_timeout_ms();
        let start = local_date_time(round_start_ms)?;

        let midnight = start
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_local_timezone(Local)
            .earliest()
            .ok_or_else(|| anyhow!("no local midnight for date: {}", start.date_naive()))?;

        let since_midnight_ms = (round_start_ms as i64 - midnight.timestamp_millis()).max(0) as u64;

        Ok(format!(
            "{}{:02}{:02}-{:02}",
            start.year(),
            start.month(),
            start.day(),
            since_midnight_ms / self.session_timeout_ms()
        ))
    }
}

impl<F: RemoteFileSystem> FileFlushStrategy for SessionBinningSink<F> {
    fn setup(&mut self) -> FlushResult {
        // No file can be opened before the first record arrives, because
        // records are the clock signal. Assume the remote side works.
        self.alive = true;
        self.failed_round = None;
        self.last_fix_attempt_ms = 0;

        FlushResult::Success
    }

    /// # Panics
    ///
    /// Appending while the sink is broken is a driver bug and panics.
    fn append(&mut self, record: &AppendRecord) -> FlushResult {
        if unlikely(!self.alive) {
            panic!("append attempt while the remote file system connection is not alive");
        }

        self.time_signal_ms = record.event_time_ms();
        self.write_record(record)
    }

    fn heartbeat(&mut self) -> FlushResult {
        if self.alive {
            // The queue is empty, so logical time is current wall time.
            self.time_signal_ms = self.clock.now_ms();

            match self.sync_open_files() {
                Ok(()) => FlushResult::Success,
                Err(e) => {
                    warn!("failed to sync remote file, error: {:#}", e);
                    self.remote_died();
                    FlushResult::Failure
                }
            }
        } else {
            // The queue may or may not be empty, just attempt a
            // reconnect.
            self.possibly_fix_connection()
        }
    }

    fn cleanup(&mut self) {
        for file in &mut self.files {
            if let Err(e) = file.writer.close() {
                warn!(
                    "failed to properly close file, path: {}, error: {:#}",
                    file.path.display(),
                    e
                );
            }
        }

        self.files.clear();
        self.rounds.clear();
    }
}

fn local_date_time(ms: u64) -> Result<DateTime<Local>> {
    let utc = DateTime::from_timestamp_millis(ms as i64)
        .ok_or_else(|| anyhow!("timestamp out of range: {}", ms))?;

    Ok(utc.with_timezone(&Local))
}
