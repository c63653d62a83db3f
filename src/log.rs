use crate::consensus::{ReplicateMsg, Term};
use std::fmt;
use std::io;

/// Index is a position in the tablet's replicated operation log. Indexes start at 1.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Index(u64);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(index)
    }

    pub fn val(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One replicated operation as it sits in the log.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub term: Term,
    pub msg: ReplicateMsg,
}

/// Log is the append-only log of replicated operations backing a tablet. Consensus owns the
/// log; appending assigns the entry's index.
pub trait Log: Send {
    /// `append()` writes the entry at the next index and returns the index it was assigned.
    fn append(&mut self, entry: LogEntry) -> Result<Index, io::Error>;

    fn read(&self, index: Index) -> Result<Option<LogEntry>, io::Error>;

    fn truncate(&mut self, index: Index);

    /// `next_index()` returns the index the next appended entry will receive.
    fn next_index(&self) -> Index;
}

// Durability is a collaborator concern; this models the log's contract in memory, which is
// all the operation pipeline and its tests need.
pub struct InMemoryLog {
    entries: Vec<LogEntry>,
}

impl InMemoryLog {
    pub fn new() -> Self {
        InMemoryLog { entries: Vec::new() }
    }

    fn vec_index(index: Index) -> usize {
        (index.val() - 1) as usize
    }
}

impl Default for InMemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for InMemoryLog {
    fn append(&mut self, entry: LogEntry) -> Result<Index, io::Error> {
        self.entries.push(entry);
        Ok(Index::new(self.entries.len() as u64))
    }

    fn read(&self, index: Index) -> Result<Option<LogEntry>, io::Error> {
        Ok(self.entries.get(Self::vec_index(index)).cloned())
    }

    fn truncate(&mut self, index: Index) {
        self.entries.truncate(Self::vec_index(index));
    }

    fn next_index(&self) -> Index {
        Index::new(self.entries.len() as u64 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operations::OperationType;
    use bytes::Bytes;

    fn entry(term: u64, payload: &'static str) -> LogEntry {
        LogEntry {
            term: Term::new(term),
            msg: ReplicateMsg {
                op_type: OperationType::Write,
                hybrid_time: None,
                monotonic_counter: 0,
                payload: Bytes::from_static(payload.as_bytes()),
            },
        }
    }

    #[test]
    fn append_assigns_indexes_from_one() {
        let mut log = InMemoryLog::new();
        assert_eq!(log.next_index(), Index::new(1));

        let first = log.append(entry(1, "a")).unwrap();
        let second = log.append(entry(1, "b")).unwrap();

        assert_eq!(first, Index::new(1));
        assert_eq!(second, Index::new(2));
        assert_eq!(log.next_index(), Index::new(3));
    }

    #[test]
    fn read_returns_the_appended_entry() {
        let mut log = InMemoryLog::new();
        log.append(entry(3, "payload")).unwrap();

        let read = log.read(Index::new(1)).unwrap().expect("entry should exist");
        assert_eq!(read.term, Term::new(3));
        assert_eq!(read.msg.payload, Bytes::from_static(b"payload"));

        assert!(log.read(Index::new(2)).unwrap().is_none());
    }

    #[test]
    fn truncate_drops_the_index_and_everything_after() {
        let mut log = InMemoryLog::new();
        log.append(entry(1, "a")).unwrap();
        log.append(entry(1, "b")).unwrap();
        log.append(entry(2, "c")).unwrap();

        log.truncate(Index::new(2));

        assert!(log.read(Index::new(2)).unwrap().is_none());
        assert_eq!(log.next_index(), Index::new(2));
    }
}
