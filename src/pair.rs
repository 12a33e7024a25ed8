//! Status barrier between a forked server child and its client parent.

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;

use crate::error::{FabtestError, Result};

/// One end of a local socket pair used only to trade an i32 status.
pub struct PairBarrier {
    stream: UnixStream,
    leader: bool,
}

impl PairBarrier {
    /// Returns (leader, follower). The leader writes first.
    pub fn pair() -> Result<(PairBarrier, PairBarrier)> {
        let (a, b) = UnixStream::pair()?;
        Ok((PairBarrier { stream: a, leader: true }, PairBarrier { stream: b, leader: false }))
    }

    fn send(&mut self, status: i32) -> Result<()> {
        self.stream.write_all(&status.to_ne_bytes())?;
        Ok(())
    }

    fn recv(&mut self) -> Result<i32> {
        let mut word = [0u8; 4];
        self.stream.read_exact(&mut word).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FabtestError::ConnectionClosed,
            _ => e.into(),
        })?;
        Ok(i32::from_ne_bytes(word))
    }

    /// Trades statuses with the other process and returns the worse one:
    /// our own failure if we have one, otherwise the peer's.
    pub fn sync(&mut self, status: i32) -> Result<i32> {
        let peer = if self.leader {
            self.send(status)?;
            self.recv()?
        } else {
            let peer = self.recv()?;
            self.send(status)?;
            peer
        };
        if peer != 0 {
            log::warn!("paired process reported status {}", peer);
        }
        Ok(if status != 0 { status } else { peer })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkRole {
    Parent { child: libc::pid_t },
    Child,
}

/// Forks the process. The parent keeps the leader end of the barrier.
///
/// Call before any threads are spawned.
pub fn fork_and_pair() -> Result<(ForkRole, PairBarrier)> {
    let (leader, follower) = PairBarrier::pair()?;
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    if pid == 0 {
        drop(leader);
        Ok((ForkRole::Child, follower))
    } else {
        drop(follower);
        Ok((ForkRole::Parent { child: pid }, leader))
    }
}

/// Reaps the child and returns its exit status.
pub fn wait_child(child: libc::pid_t) -> Result<i32> {
    let mut status: libc::c_int = 0;
    loop {
        let ret = unsafe { libc::waitpid(child, &mut status, 0) };
        if ret >= 0 {
            break;
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
    if libc::WIFEXITED(status) {
        Ok(libc::WEXITSTATUS(status))
    } else {
        Err(FabtestError::setup(format!("child {} did not exit cleanly", child), -libc::ECHILD))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn both_sides_see_the_failure() {
        let (mut leader, mut follower) = PairBarrier::pair().unwrap();
        let t = thread::spawn(move || follower.sync(-libc::EIO).unwrap());
        assert_eq!(leader.sync(0).unwrap(), -libc::EIO);
        assert_eq!(t.join().unwrap(), -libc::EIO);
    }

    #[test]
    fn success_when_both_succeed() {
        let (mut leader, mut follower) = PairBarrier::pair().unwrap();
        let t = thread::spawn(move || follower.sync(0).unwrap());
        assert_eq!(leader.sync(0).unwrap(), 0);
        assert_eq!(t.join().unwrap(), 0);
    }

    #[test]
    fn closed_peer_is_reported() {
        let (mut leader, follower) = PairBarrier::pair().unwrap();
        drop(follower);
        assert!(leader.sync(0).is_err());
    }
}
