//! On-disk journal record codec.
//!
//! Every record is framed as `{length: u32, kind: u16, timestamp: u64}`,
//! little-endian, with `length` covering the 14-byte header. Record kinds
//! are two packed ASCII bytes and are stable on disk. The codec is pure:
//! encoding writes into a buffer, decoding reads from one, and neither
//! performs I/O.

use tanoak_core::buf::{BufReader, BufWriter};
use tanoak_core::clock::Timestamp;
use tanoak_core::page::{PageAddress, TreeHandle, VolumeHandle};

use crate::error::CorruptRecord;

/// Global byte address within the journal. The segment generation holding
/// an address is `address / block_size`.
pub type JournalAddress = u64;

const fn tag(hi: u8, lo: u8) -> u16 {
    ((hi as u16) << 8) | lo as u16
}

/// Stable on-disk record kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RecordKind {
    /// Bind a volume handle to a `{name, id}`.
    InstallVolume = tag(b'I', b'V'),
    /// Bind a tree handle to a `{volumeHandle, treeName}`.
    InstallTree = tag(b'I', b'T'),
    /// Dirty page snapshot, held until copied back to its volume.
    PageImage = tag(b'P', b'A'),
    /// Transaction begin.
    TxStart = tag(b'T', b'S'),
    /// Transaction commit.
    TxCommit = tag(b'T', b'C'),
    /// Transaction rollback.
    TxRollback = tag(b'T', b'R'),
    /// Continuation marker written when a live transaction's chain crosses
    /// a generation boundary.
    TxJoin = tag(b'T', b'J'),
    /// Container of one chunk of a transaction's update stream.
    Tx = tag(b'T', b'X'),
    /// Store of a key/value pair (inside a `Tx` container).
    Store = tag(b'S', b'R'),
    /// Range delete with prefix elision (inside a `Tx` container).
    RangeDelete = tag(b'D', b'R'),
    /// Whole-tree delete (inside a `Tx` container).
    TreeDelete = tag(b'D', b'T'),
    /// Accumulator delta of one (inside a `Tx` container).
    DeltaOne = tag(b'D', b'0'),
    /// Accumulator delta with an explicit value (inside a `Tx` container).
    DeltaValue = tag(b'D', b'1'),
    /// Durability barrier: all pages dirtied at or before the record's
    /// timestamp are in their volume.
    Checkpoint = tag(b'C', b'P'),
}

impl RecordKind {
    const ALL: [RecordKind; 14] = [
        RecordKind::InstallVolume,
        RecordKind::InstallTree,
        RecordKind::PageImage,
        RecordKind::TxStart,
        RecordKind::TxCommit,
        RecordKind::TxRollback,
        RecordKind::TxJoin,
        RecordKind::Tx,
        RecordKind::Store,
        RecordKind::RangeDelete,
        RecordKind::TreeDelete,
        RecordKind::DeltaOne,
        RecordKind::DeltaValue,
        RecordKind::Checkpoint,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    /// `true` for the kinds that may only appear inside a `Tx` container.
    pub fn is_update(self) -> bool {
        matches!(
            self,
            RecordKind::Store
                | RecordKind::RangeDelete
                | RecordKind::TreeDelete
                | RecordKind::DeltaOne
                | RecordKind::DeltaValue
        )
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = self.code();
        write!(f, "{}{}", (code >> 8) as u8 as char, (code & 0xff) as u8 as char)
    }
}

/// The fixed prefix of every journal record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    /// Total record length, header included.
    pub length: u32,
    pub kind: RecordKind,
    pub timestamp: Timestamp,
}

impl RecordHeader {
    pub const LEN: usize = 4 + 2 + 8;

    pub fn encode(&self, out: &mut impl BufWriter) {
        out.put_u32(self.length);
        out.put_u16(self.kind.code());
        out.put_u64(self.timestamp);
    }

    /// Decode a header. `offset` locates the record for error attribution.
    pub fn decode<'a>(reader: &mut impl BufReader<'a>, offset: u64) -> Result<Self, CorruptRecord> {
        if reader.remaining() < Self::LEN {
            return Err(CorruptRecord::new(offset, "truncated record header"));
        }
        let length = reader.get_u32().expect("length checked");
        let code = reader.get_u16().expect("length checked");
        let timestamp = reader.get_u64().expect("length checked");

        let kind = RecordKind::from_code(code)
            .ok_or_else(|| CorruptRecord::new(offset, format!("unknown record kind {code:#06x}")))?;
        if (length as usize) < Self::LEN {
            return Err(CorruptRecord::new(
                offset,
                format!("record length {length} shorter than its header"),
            ));
        }
        Ok(Self {
            length,
            kind,
            timestamp,
        })
    }

    /// Payload bytes following the header.
    pub fn payload_len(&self) -> usize {
        self.length as usize - Self::LEN
    }
}

/// Accumulator families addressed by delta records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AccumulatorKind {
    Sum = 0,
    Max = 1,
    Min = 2,
    Seq = 3,
}

impl AccumulatorKind {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => AccumulatorKind::Sum,
            1 => AccumulatorKind::Max,
            2 => AccumulatorKind::Min,
            3 => AccumulatorKind::Seq,
            _ => return None,
        })
    }
}

/// A record of the outer journal stream.
///
/// Update records (`SR`, `DR`, `DT`, `D0`, `D1`) never appear here: they
/// ride inside a [`Record::Tx`] container's payload and are decoded as
/// [`Update`]s.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Record {
    InstallVolume {
        handle: VolumeHandle,
        id: u64,
        name: String,
    },
    InstallTree {
        handle: TreeHandle,
        volume: VolumeHandle,
        name: String,
    },
    PageImage {
        volume: VolumeHandle,
        page: PageAddress,
        data: Vec<u8>,
    },
    TxStart,
    TxCommit {
        commit_ts: Timestamp,
    },
    TxRollback,
    TxJoin,
    Tx {
        /// Zero in chunks written before the transaction committed.
        commit_ts: Timestamp,
        /// Address of the previous chunk of the same transaction, zero in
        /// the earliest chunk.
        backchain: JournalAddress,
        /// Concatenation of framed [`Update`] records.
        updates: Vec<u8>,
    },
    Checkpoint,
}

impl Record {
    pub fn kind(&self) -> RecordKind {
        match self {
            Record::InstallVolume { .. } => RecordKind::InstallVolume,
            Record::InstallTree { .. } => RecordKind::InstallTree,
            Record::PageImage { .. } => RecordKind::PageImage,
            Record::TxStart => RecordKind::TxStart,
            Record::TxCommit { .. } => RecordKind::TxCommit,
            Record::TxRollback => RecordKind::TxRollback,
            Record::TxJoin => RecordKind::TxJoin,
            Record::Tx { .. } => RecordKind::Tx,
            Record::Checkpoint => RecordKind::Checkpoint,
        }
    }

    /// Total encoded length, header included.
    pub fn encoded_len(&self) -> usize {
        RecordHeader::LEN
            + match self {
                Record::InstallVolume { name, .. } => 4 + 8 + name.len(),
                Record::InstallTree { name, .. } => 4 + 4 + name.len(),
                Record::PageImage { data, .. } => 4 + 8 + data.len(),
                Record::TxStart | Record::TxRollback | Record::TxJoin | Record::Checkpoint => 0,
                Record::TxCommit { .. } => 8,
                Record::Tx { updates, .. } => 8 + 8 + updates.len(),
            }
    }

    /// Encode the full record, header included, stamped with `timestamp`.
    pub fn encode(&self, timestamp: Timestamp, out: &mut Vec<u8>) {
        RecordHeader {
            length: self.encoded_len() as u32,
            kind: self.kind(),
            timestamp,
        }
        .encode(out);
        match self {
            Record::InstallVolume { handle, id, name } => {
                out.put_u32(handle.0);
                out.put_u64(*id);
                out.put_slice(name.as_bytes());
            }
            Record::InstallTree { handle, volume, name } => {
                out.put_u32(handle.0);
                out.put_u32(volume.0);
                out.put_slice(name.as_bytes());
            }
            Record::PageImage { volume, page, data } => {
                out.put_u32(volume.0);
                out.put_u64(*page);
                out.put_slice(data);
            }
            Record::TxStart | Record::TxRollback | Record::TxJoin | Record::Checkpoint => {}
            Record::TxCommit { commit_ts } => {
                out.put_u64(*commit_ts);
            }
            Record::Tx {
                commit_ts,
                backchain,
                updates,
            } => {
                out.put_u64(*commit_ts);
                out.put_u64(*backchain);
                out.put_slice(updates);
            }
        }
    }

    /// Decode the payload of a record whose header has already been read.
    ///
    /// `payload` must hold exactly [`RecordHeader::payload_len`] bytes;
    /// `offset` locates the record for error attribution.
    pub fn decode(header: &RecordHeader, payload: &[u8], offset: u64) -> Result<Self, CorruptRecord> {
        let mut reader = payload;
        if payload.len() != header.payload_len() {
            return Err(CorruptRecord::new(offset, "record payload shorter than its length"));
        }
        let short = |what: &'static str| CorruptRecord::new(offset, format!("truncated {what} payload"));

        let record = match header.kind {
            RecordKind::InstallVolume => {
                let handle = reader.get_u32().map_err(|_| short("IV"))?;
                let id = reader.get_u64().map_err(|_| short("IV"))?;
                let name = decode_name(reader, offset)?;
                Record::InstallVolume {
                    handle: VolumeHandle(handle),
                    id,
                    name,
                }
            }
            RecordKind::InstallTree => {
                let handle = reader.get_u32().map_err(|_| short("IT"))?;
                let volume = reader.get_u32().map_err(|_| short("IT"))?;
                let name = decode_name(reader, offset)?;
                Record::InstallTree {
                    handle: TreeHandle(handle),
                    volume: VolumeHandle(volume),
                    name,
                }
            }
            RecordKind::PageImage => {
                let volume = reader.get_u32().map_err(|_| short("PA"))?;
                let page = reader.get_u64().map_err(|_| short("PA"))?;
                Record::PageImage {
                    volume: VolumeHandle(volume),
                    page,
                    data: reader.to_vec(),
                }
            }
            RecordKind::TxStart => Record::TxStart,
            RecordKind::TxCommit => {
                let commit_ts = reader.get_u64().map_err(|_| short("TC"))?;
                Record::TxCommit { commit_ts }
            }
            RecordKind::TxRollback => Record::TxRollback,
            RecordKind::TxJoin => Record::TxJoin,
            RecordKind::Tx => {
                let commit_ts = reader.get_u64().map_err(|_| short("TX"))?;
                let backchain = reader.get_u64().map_err(|_| short("TX"))?;
                Record::Tx {
                    commit_ts,
                    backchain,
                    updates: reader.to_vec(),
                }
            }
            RecordKind::Checkpoint => Record::Checkpoint,
            kind if kind.is_update() => {
                return Err(CorruptRecord::new(
                    offset,
                    format!("update record {kind} outside a transaction container"),
                ));
            }
            kind => {
                return Err(CorruptRecord::new(offset, format!("unexpected record kind {kind}")));
            }
        };
        Ok(record)
    }
}

fn decode_name(bytes: &[u8], offset: u64) -> Result<String, CorruptRecord> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| CorruptRecord::new(offset, "name is not valid UTF-8"))
}

/// An update record riding inside a [`Record::Tx`] container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update {
    Store {
        tree: TreeHandle,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    RangeDelete {
        tree: TreeHandle,
        /// Bytes the upper bound shares with `key1`.
        elision: u16,
        key1: Vec<u8>,
        key2_suffix: Vec<u8>,
    },
    TreeDelete {
        tree: TreeHandle,
    },
    DeltaOne {
        tree: TreeHandle,
        accumulator: AccumulatorKind,
        index: u32,
    },
    DeltaValue {
        tree: TreeHandle,
        accumulator: AccumulatorKind,
        index: u32,
        value: i64,
    },
}

impl Update {
    pub fn kind(&self) -> RecordKind {
        match self {
            Update::Store { .. } => RecordKind::Store,
            Update::RangeDelete { .. } => RecordKind::RangeDelete,
            Update::TreeDelete { .. } => RecordKind::TreeDelete,
            Update::DeltaOne { .. } => RecordKind::DeltaOne,
            Update::DeltaValue { .. } => RecordKind::DeltaValue,
        }
    }

    pub fn tree(&self) -> TreeHandle {
        match self {
            Update::Store { tree, .. }
            | Update::RangeDelete { tree, .. }
            | Update::TreeDelete { tree }
            | Update::DeltaOne { tree, .. }
            | Update::DeltaValue { tree, .. } => *tree,
        }
    }

    pub fn encoded_len(&self) -> usize {
        RecordHeader::LEN
            + match self {
                Update::Store { key, value, .. } => 4 + 2 + key.len() + value.len(),
                Update::RangeDelete { key1, key2_suffix, .. } => 4 + 2 + 2 + key1.len() + key2_suffix.len(),
                Update::TreeDelete { .. } => 4,
                Update::DeltaOne { .. } => 4 + 1 + 4,
                Update::DeltaValue { .. } => 4 + 1 + 4 + 8,
            }
    }

    /// Encode the framed update, stamped with the owning transaction's
    /// start timestamp.
    pub fn encode(&self, timestamp: Timestamp, out: &mut Vec<u8>) {
        RecordHeader {
            length: self.encoded_len() as u32,
            kind: self.kind(),
            timestamp,
        }
        .encode(out);
        match self {
            Update::Store { tree, key, value } => {
                out.put_u32(tree.0);
                out.put_u16(key.len() as u16);
                out.put_slice(key);
                out.put_slice(value);
            }
            Update::RangeDelete {
                tree,
                elision,
                key1,
                key2_suffix,
            } => {
                out.put_u32(tree.0);
                out.put_u16(key1.len() as u16);
                out.put_u16(*elision);
                out.put_slice(key1);
                out.put_slice(key2_suffix);
            }
            Update::TreeDelete { tree } => {
                out.put_u32(tree.0);
            }
            Update::DeltaOne {
                tree,
                accumulator,
                index,
            } => {
                out.put_u32(tree.0);
                out.put_u8(*accumulator as u8);
                out.put_u32(*index);
            }
            Update::DeltaValue {
                tree,
                accumulator,
                index,
                value,
            } => {
                out.put_u32(tree.0);
                out.put_u8(*accumulator as u8);
                out.put_u32(*index);
                out.put_i64(*value);
            }
        }
    }

    /// Decode the next framed update from `buf`, advancing it.
    ///
    /// `at` is the journal address of `buf`'s current position, for error
    /// attribution.
    pub fn decode(buf: &mut &[u8], at: u64) -> Result<(RecordHeader, Update), CorruptRecord> {
        let header = RecordHeader::decode(buf, at)?;
        if !header.kind.is_update() {
            return Err(CorruptRecord::new(
                at,
                format!("record kind {} is not a transaction update", header.kind),
            ));
        }
        let payload = buf
            .get_slice(header.payload_len())
            .map_err(|_| CorruptRecord::new(at, "truncated update payload"))?;
        let update = Self::decode_payload(&header, payload, at)?;
        Ok((header, update))
    }

    fn decode_payload(header: &RecordHeader, payload: &[u8], at: u64) -> Result<Update, CorruptRecord> {
        let mut reader = payload;
        let short = |what: &'static str| CorruptRecord::new(at, format!("truncated {what} payload"));

        let update = match header.kind {
            RecordKind::Store => {
                let tree = reader.get_u32().map_err(|_| short("SR"))?;
                let key_len = reader.get_u16().map_err(|_| short("SR"))? as usize;
                let key = reader.get_slice(key_len).map_err(|_| short("SR"))?;
                Update::Store {
                    tree: TreeHandle(tree),
                    key: key.to_vec(),
                    value: reader.to_vec(),
                }
            }
            RecordKind::RangeDelete => {
                let tree = reader.get_u32().map_err(|_| short("DR"))?;
                let key1_len = reader.get_u16().map_err(|_| short("DR"))? as usize;
                let elision = reader.get_u16().map_err(|_| short("DR"))?;
                let key1 = reader.get_slice(key1_len).map_err(|_| short("DR"))?;
                Update::RangeDelete {
                    tree: TreeHandle(tree),
                    elision,
                    key1: key1.to_vec(),
                    key2_suffix: reader.to_vec(),
                }
            }
            RecordKind::TreeDelete => {
                let tree = reader.get_u32().map_err(|_| short("DT"))?;
                Update::TreeDelete { tree: TreeHandle(tree) }
            }
            RecordKind::DeltaOne | RecordKind::DeltaValue => {
                let tree = reader.get_u32().map_err(|_| short("delta"))?;
                let acc_code = reader.get_u8().map_err(|_| short("delta"))?;
                let index = reader.get_u32().map_err(|_| short("delta"))?;
                let accumulator = AccumulatorKind::from_code(acc_code).ok_or_else(|| {
                    CorruptRecord::new(at, format!("unknown accumulator kind {acc_code}"))
                })?;
                if header.kind == RecordKind::DeltaOne {
                    Update::DeltaOne {
                        tree: TreeHandle(tree),
                        accumulator,
                        index,
                    }
                } else {
                    let value = reader.get_i64().map_err(|_| short("delta"))?;
                    Update::DeltaValue {
                        tree: TreeHandle(tree),
                        accumulator,
                        index,
                        value,
                    }
                }
            }
            kind => {
                return Err(CorruptRecord::new(
                    at,
                    format!("record kind {kind} is not a transaction update"),
                ));
            }
        };
        Ok(update)
    }
}

/// Encode a whole record to a fresh buffer. Test and convenience helper.
pub fn encode_record(record: &Record, timestamp: Timestamp) -> Vec<u8> {
    let mut out = Vec::with_capacity(record.encoded_len());
    record.encode(timestamp, &mut out);
    out
}
