//! Sinker is the component of Divolte that flushes collected events into
//! container files on a remote append-only file system.
//!
//! Events come off the upstream queue as pre-encoded container rows, each
//! carrying its server-side event time and the session id it belongs to.
//! The interesting problem is placement: analysis downstream wants all
//! events of one session in one file, but sessions are open-ended and the
//! remote file system only appends.
//!
//! The session binning strategy solves this with time buckets. Every
//! timestamp maps to a round, defined as the timestamp divided by the
//! session timeout, and each round gets its own output file. An event is
//! binned by the round its *session started* in, not the round it arrived
//! in, so a file must outlive its own round: it stays open for three
//! session lengths, one for the round itself and two of headroom for late
//! events of sessions that began near the round's end.
//!
//! Which clock decides that a round is over? Not the wall clock: the queue
//! may lag arbitrarily far behind real time, and closing files on wall
//! time would strand the lagging events. Instead the event timestamps
//! themselves are the clock signal. Only when the queue is empty (the
//! driver sends heartbeats instead of records) is the wall clock taken as
//! the signal, because an empty queue means we are caught up with it.
//!
//! Exceptionally long sessions can outlive even the three-round window.
//! Their late events fall into the oldest file still open, which keeps the
//! per-file guarantee intact for everyone else: a file that was opened,
//! flushed and closed without remote failures fully contains every session
//! that started in it and lasted less than the session timeout.
//!
//! Remote failures void that guarantee for the files that are open when
//! the failure hits. All of them are closed best-effort, the sink goes
//! into a reconnect cycle, and the round that caused the failure is the
//! first one recreated once the remote side answers again.

pub mod config;
pub mod container;
pub mod flusher;
pub mod record_reader;
pub mod remote_fs;
pub mod session_binning;
