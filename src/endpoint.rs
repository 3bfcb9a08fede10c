use log::trace;
use std::fmt;
use std::io::{Error, ErrorKind, Result};

use super::buffer::Buffer;
use super::conn::Transport;

// Read/write rounds per dispatch before yielding to other sessions.
const MAX_ROUNDS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    pub fn reverse(self) -> Direction {
        match self {
            Direction::Upstream => Direction::Downstream,
            Direction::Downstream => Direction::Upstream,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("client->compositor"),
            Direction::Downstream => f.write_str("compositor->client"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Open,
    Closed,
}

/// One direction of a session: pulls bytes and descriptors from a source
/// into its buffer and pushes them on to a destination.
#[derive(Debug)]
pub struct Endpoint {
    direction: Direction,
    buffer: Buffer,
    forwarded_bytes: u64,
    forwarded_fds: u64,
}

impl Endpoint {
    pub fn new(direction: Direction, capacity: usize) -> Self {
        Endpoint {
            direction,
            buffer: Buffer::with_capacity(capacity),
            forwarded_bytes: 0,
            forwarded_fds: 0,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn forwarded_bytes(&self) -> u64 {
        self.forwarded_bytes
    }

    pub fn forwarded_fds(&self) -> u64 {
        self.forwarded_fds
    }

    pub fn wants_read(&self) -> bool {
        self.buffer.has_room()
    }

    pub fn wants_write(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Reads what the source has and writes what the destination takes,
    /// repeating while either side makes progress. `WouldBlock` on either side
    /// ends the pass; any other error is returned.
    pub fn pump<S, D>(&mut self, src: &S, dst: &D) -> Result<Flow>
    where
        S: Transport + ?Sized,
        D: Transport + ?Sized,
    {
        for _ in 0..MAX_ROUNDS {
            let mut progressed = false;

            if self.buffer.has_room() {
                match self
                    .buffer
                    .fill_with(|spare, fds, max_fds| src.recv(spare, fds, max_fds))
                {
                    Ok(0) => {
                        trace!("{}: end of stream", self.direction);
                        return Ok(Flow::Closed);
                    }
                    Ok(size) => {
                        trace!("{}: received {} bytes", self.direction, size);
                        progressed = true;
                    }
                    Err(err) if err.kind() == ErrorKind::WouldBlock => (),
                    Err(err) => return Err(err),
                }
            }

            if self.flush(dst)? > 0 {
                progressed = true;
            }

            if !progressed {
                break;
            }
        }
        Ok(Flow::Open)
    }

    pub fn flush<D>(&mut self, dst: &D) -> Result<usize>
    where
        D: Transport + ?Sized,
    {
        let mut total = 0;
        while !self.buffer.is_empty() {
            let (result, fd_count) = {
                let pending = self.buffer.read_available();
                (dst.send(pending.bytes, pending.fds), pending.fds.len())
            };
            match result {
                Ok(0) => {
                    return Err(Error::new(
                        ErrorKind::WriteZero,
                        "destination accepted no bytes",
                    ))
                }
                Ok(size) => {
                    self.buffer.consume(size);
                    self.forwarded_bytes += size as u64;
                    self.forwarded_fds += fd_count as u64;
                    total += size;
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => return Err(err),
            }
        }
        if total > 0 {
            trace!("{}: sent {} bytes", self.direction, total);
        }
        Ok(total)
    }
}
