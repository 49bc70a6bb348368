// SPDX-License-Identifier: BSD-3-Clause
// Copyright (c) Qualcomm Technologies, Inc. and/or its subsidiaries.

//! Scripted stand-in for a device channel, so protocol tests run without
//! hardware on the bus.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use crate::types::{FirehoseConfiguration, QdlChan, QdlReadWrite};

pub(crate) struct MockChannel {
    reads: VecDeque<io::Result<Vec<u8>>>,
    /// Every outbound transfer, with its eot flag.
    pub writes: Vec<(Vec<u8>, bool)>,
    /// The timeout passed to each read, for asserting timeout stepping.
    pub read_timeouts: Vec<Duration>,
    cfg: FirehoseConfiguration,
}

impl MockChannel {
    pub fn new() -> Self {
        Self {
            reads: VecDeque::new(),
            writes: vec![],
            read_timeouts: vec![],
            cfg: FirehoseConfiguration::default(),
        }
    }

    /// Script one inbound transfer.
    pub fn push_read(&mut self, data: Vec<u8>) {
        self.reads.push_back(Ok(data));
    }

    /// Script a read that times out, ending the current exchange.
    pub fn push_timeout(&mut self) {
        self.reads
            .push_back(Err(io::Error::from(io::ErrorKind::TimedOut)));
    }
}

impl QdlReadWrite for MockChannel {
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.read_timeouts.push(timeout);

        match self.reads.pop_front() {
            Some(Ok(data)) => {
                assert!(data.len() <= buf.len(), "scripted read larger than buffer");
                buf[..data.len()].copy_from_slice(&data);
                Ok(data.len())
            }
            Some(Err(e)) => Err(e),
            None => Err(io::Error::from(io::ErrorKind::TimedOut)),
        }
    }

    fn write_eot(&mut self, buf: &[u8], eot: bool) -> io::Result<usize> {
        self.writes.push((buf.to_vec(), eot));
        Ok(buf.len())
    }
}

impl QdlChan for MockChannel {
    fn rw(&mut self) -> &mut dyn QdlReadWrite {
        self
    }

    fn fh_config(&self) -> &FirehoseConfiguration {
        &self.cfg
    }

    fn mut_fh_config(&mut self) -> &mut FirehoseConfiguration {
        &mut self.cfg
    }
}

pub(crate) fn ack_response() -> Vec<u8> {
    br#"<?xml version="1.0"?><data><response value="ACK" rawmode="false"/></data>"#.to_vec()
}

pub(crate) fn nak_response() -> Vec<u8> {
    br#"<?xml version="1.0"?><data><response value="NAK" rawmode="false"/></data>"#.to_vec()
}

pub(crate) fn log_response(msg: &str) -> Vec<u8> {
    format!(r#"<?xml version="1.0"?><data><log value="{msg}"/></data>"#).into_bytes()
}
