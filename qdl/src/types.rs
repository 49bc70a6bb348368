// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.
use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;
use indexmap::IndexMap;
use thiserror::Error;

/// Session max payload proposed to the target; the <configure> handshake
/// may replace it with whatever the device actually supports.
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 1048576;

/// A bulk channel to a device in EDL mode.
///
/// The device firmware is strict about USB framing: a transfer that is an
/// exact multiple of the endpoint max packet size must be terminated with a
/// zero-length packet, and reads have to carry their own timeout since the
/// target goes quiet between protocol phases.
pub trait QdlReadWrite {
    /// One bulk IN transfer of at most `buf.len()` bytes. Returns 0 when the
    /// device sent a ZLP. Timeouts surface as `io::ErrorKind::TimedOut`.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Write all of `buf` as bulk OUT transfers no larger than the endpoint
    /// max packet size. With `eot` set, a trailing ZLP is appended whenever
    /// the total length is a non-zero multiple of the max packet size; an
    /// empty `eot` write degenerates to a single ZLP.
    fn write_eot(&mut self, buf: &[u8], eot: bool) -> io::Result<usize>;
}

/// Firehose/Sahara engines run against anything that can hand out the
/// transport plus the session configuration.
pub trait QdlChan {
    fn rw(&mut self) -> &mut dyn QdlReadWrite;
    fn fh_config(&self) -> &FirehoseConfiguration;
    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration;
}

/// A device we talk to, usually constructed once in main().
pub struct QdlDevice<'a> {
    pub rw: &'a mut dyn QdlReadWrite,
    pub fh_cfg: FirehoseConfiguration,
}

impl QdlChan for QdlDevice<'_> {
    fn rw(&mut self) -> &mut dyn QdlReadWrite {
        &mut *self.rw
    }

    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.fh_cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.fh_cfg
    }
}

#[derive(Debug)]
pub struct FirehoseConfiguration {
    pub storage_type: FirehoseStorageType,
    /// Negotiated through <configure>; every <program> payload chunk is
    /// sized against this.
    pub max_payload_size: usize,
    /// Skip non-firmware partitions while programming.
    pub fw_only: bool,
    /// Dump firehose traffic to stderr.
    pub debug: bool,
}

impl Default for FirehoseConfiguration {
    fn default() -> Self {
        Self {
            storage_type: FirehoseStorageType::Ufs,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            fw_only: false,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseStorageType {
    Emmc,
    Ufs,
}

impl FromStr for FirehoseStorageType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "emmc" => Ok(Self::Emmc),
            "ufs" => Ok(Self::Ufs),
            _ => bail!("unknown storage type \"{s}\", expected emmc or ufs"),
        }
    }
}

impl fmt::Display for FirehoseStorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Emmc => write!(f, "emmc"),
            Self::Ufs => write!(f, "ufs"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirehoseStatus {
    Ack,
    Nak,
}

/// Which command the device refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NakError {
    Configure,
    Program,
    Patch,
    Ufs,
    SetBootable,
    Power,
}

#[derive(Debug, Error)]
pub enum FirehoseError {
    #[error("I/O error on the firehose channel: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for a firehose response")]
    Timeout,

    #[error("short write on the firehose channel: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("firehose response truncated (no </data> terminator)")]
    TruncatedPacket,

    #[error("firehose response is not UTF-8 text")]
    NonTextResponse,

    #[error("failed to parse firehose packet: {0}")]
    Xml(#[from] xmltree::ParseError),

    #[error("failed to emit firehose packet: {0}")]
    XmlWrite(#[from] xmltree::Error),

    #[error("malformed firehose response attributes: {0:?}")]
    MalformedData(IndexMap<String, String>),

    #[error("device NAKed {0:?}")]
    Nak(NakError),
}

#[derive(Debug, Error)]
pub enum SaharaError {
    #[error("I/O error on the sahara channel: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode sahara packet: {0}")]
    Encode(#[from] bincode::Error),

    #[error("sahara packet of {0} bytes is shorter than the header")]
    Runt(usize),

    #[error("sahara length field {header:#x} doesn't match {wire:#x} bytes on the wire")]
    LengthMismatch { header: usize, wire: usize },

    #[error("unexpected length {length:#x} for sahara command {cmd:#x}")]
    UnexpectedLength { cmd: u32, length: usize },

    #[error("read of {length:#x} bytes at {offset:#x} lies outside the {image_len} byte loader")]
    ReadOutOfBounds {
        offset: u64,
        length: u64,
        image_len: usize,
    },

    #[error("short write to sahara: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("target left sahara with status {0:#x}")]
    TargetStatus(u32),
}
