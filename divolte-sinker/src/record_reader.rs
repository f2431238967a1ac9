use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::error;

use divolte_core::error_bail;
use divolte_core::event_id::EventId;
use divolte_core::record::AppendRecord;

/// Reads `AppendRecord`s from local feed files.
///
/// One record per line, three tab-separated fields: the event time in
/// milliseconds, the session id in wire form, and the pre-encoded record
/// bytes in standard base64. Blank lines are skipped.
pub struct RecordFileReader {
    filenames: Vec<String>,
    reader: Option<BufReader<File>>,
    pos: usize,
}

impl RecordFileReader {
    pub fn new(filenames: &[String]) -> Result<Self> {
        // Check if all files exist
        for filename in filenames {
            if !Path::new(filename).exists() {
                error_bail!("file not found: {}", filename.clone());
            }
        }

        Ok(Self {
            filenames: filenames.to_vec(),
            reader: None,
            pos: 0,
        })
    }

    fn open_next_file(&mut self) -> Result<()> {
        if self.pos >= self.filenames.len() {
            bail!("no more files");
        }

        let filename = &self.filenames[self.pos];
        let file = File::open(Path::new(filename))?;

        self.pos += 1;
        self.reader = Some(BufReader::new(file));

        Ok(())
    }

    fn read_from_next_file(&mut self) -> Option<Result<AppendRecord>> {
        match self.open_next_file() {
            Ok(_) => self.next(),
            Err(_) => None,
        }
    }
}

impl Iterator for RecordFileReader {
    type Item = Result<AppendRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.reader.as_mut() {
            Some(reader) => {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => self.read_from_next_file(),
                    Ok(_) => {
                        let line = line.trim_end();
                        if line.is_empty() {
                            return self.next();
                        }

                        Some(parse_record_line(line))
                    }
                    Err(e) => Some(Err(e.into())),
                }
            }
            None => self.read_from_next_file(),
        }
    }
}

/// Parse one feed line into a record.
pub fn parse_record_line(line: &str) -> Result<AppendRecord> {
    let mut fields = line.splitn(3, '\t');

    let (event_time, session_id, payload) = match (fields.next(), fields.next(), fields.next()) {
        (Some(event_time), Some(session_id), Some(payload)) => (event_time, session_id, payload),
        _ => bail!("record line must have three tab-separated fields"),
    };

    let event_time = event_time
        .parse::<u64>()
        .map_err(|e| anyhow!("invalid event time: {}, error: {}", event_time, e))?;

    let session_id = match EventId::try_parse(session_id) {
        Some(session_id) => session_id,
        None => bail!("invalid session id: {}", session_id),
    };

    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| anyhow!("invalid record payload, error: {}", e))?;

    Ok(AppendRecord::new(event_time, session_id, bytes))
}

/// Render a record as one feed line, the inverse of `parse_record_line`.
pub fn format_record_line(record: &AppendRecord) -> String {
    format!(
        "{}\t{}\t{}",
        record.event_time_ms(),
        record.session_id(),
        STANDARD.encode(record.bytes())
    )
}
