//! Poll-driven event dispatcher.
//!
//! Two source kinds over one epoll: file descriptors (readable/writable
//! interest, composite readiness out) and one-shot timers (timerfd,
//! re-armed explicitly with a millisecond delay). Sources carry a caller
//! token; a dispatch pass drains whatever is ready and hands back
//! `(token, readiness)` pairs for the owner to route. The epoll fd itself
//! is exposed so a caller can sleep in its own poll and dispatch only when
//! something is pending.

use std::collections::HashMap;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use bitflags::bitflags;
use rustix::event::epoll;
use rustix::time::{
    timerfd_create, timerfd_settime, Itimerspec, TimerfdClockId, TimerfdFlags, TimerfdTimerFlags,
    Timespec,
};

use crate::error::{Error, Result};

bitflags! {
    /// Readiness mask delivered to fd sources; `READABLE`/`WRITABLE` also
    /// express interest at registration.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Readiness: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const HANGUP = 1 << 2;
        const ERROR = 1 << 3;
    }
}

/// Identifies a registered source. Never reused while the source lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

enum Entry<T> {
    Fd { raw: RawFd, token: T },
    Timer { fd: OwnedFd, token: T },
}

pub(crate) struct EventLoop<T> {
    epoll: OwnedFd,
    sources: HashMap<u64, Entry<T>>,
    next_id: u64,
}

impl<T: Copy> EventLoop<T> {
    pub fn new() -> Result<EventLoop<T>> {
        let epoll = epoll::create(epoll::CreateFlags::CLOEXEC)?;
        Ok(EventLoop { epoll, sources: HashMap::new(), next_id: 1 })
    }

    /// The pollable loop fd (readable whenever a dispatch would find work).
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.epoll.as_fd()
    }

    /// Watch `fd` for the given interest. The caller keeps ownership and
    /// must call [`remove_fd`](Self::remove_fd) before closing it.
    pub fn add_fd(&mut self, fd: BorrowedFd<'_>, interest: Readiness, token: T) -> Result<SourceId> {
        let id = self.next_id;
        epoll::add(
            &self.epoll,
            fd,
            epoll::EventData::new_u64(id),
            interest_flags(interest),
        )?;
        self.next_id += 1;
        self.sources.insert(id, Entry::Fd { raw: fd.as_raw_fd(), token });
        Ok(SourceId(id))
    }

    /// Change the interest set of an fd source.
    pub fn update_fd(&mut self, id: SourceId, interest: Readiness) -> Result<()> {
        let entry = self.sources.get(&id.0).ok_or(Error::InvalidParameter)?;
        let Entry::Fd { raw, .. } = entry else {
            return Err(Error::InvalidParameter);
        };
        // The fd is alive per the add_fd contract.
        let fd = unsafe { BorrowedFd::borrow_raw(*raw) };
        epoll::modify(
            &self.epoll,
            fd,
            epoll::EventData::new_u64(id.0),
            interest_flags(interest),
        )?;
        Ok(())
    }

    pub fn remove_fd(&mut self, id: SourceId) -> Result<()> {
        match self.sources.remove(&id.0) {
            Some(Entry::Fd { raw, .. }) => {
                let fd = unsafe { BorrowedFd::borrow_raw(raw) };
                epoll::delete(&self.epoll, fd)?;
                Ok(())
            }
            Some(entry @ Entry::Timer { .. }) => {
                self.sources.insert(id.0, entry);
                Err(Error::InvalidParameter)
            }
            None => Err(Error::InvalidParameter),
        }
    }

    /// Create a disarmed one-shot timer source.
    pub fn add_timer(&mut self, token: T) -> Result<SourceId> {
        let fd = timerfd_create(
            TimerfdClockId::Monotonic,
            TimerfdFlags::NONBLOCK | TimerfdFlags::CLOEXEC,
        )?;
        let id = self.next_id;
        epoll::add(
            &self.epoll,
            &fd,
            epoll::EventData::new_u64(id),
            epoll::EventFlags::IN,
        )?;
        self.next_id += 1;
        self.sources.insert(id, Entry::Timer { fd, token });
        Ok(SourceId(id))
    }

    /// Arm a timer to fire once in `ms_delay` milliseconds; 0 disarms.
    pub fn update_timer(&mut self, id: SourceId, ms_delay: u64) -> Result<()> {
        let entry = self.sources.get(&id.0).ok_or(Error::InvalidParameter)?;
        let Entry::Timer { fd, .. } = entry else {
            return Err(Error::InvalidParameter);
        };
        let spec = Itimerspec {
            it_interval: Timespec { tv_sec: 0, tv_nsec: 0 },
            it_value: Timespec {
                tv_sec: (ms_delay / 1_000) as i64,
                tv_nsec: (ms_delay % 1_000) as i64 * 1_000_000,
            },
        };
        timerfd_settime(fd, TimerfdTimerFlags::empty(), &spec)?;
        Ok(())
    }

    pub fn remove_timer(&mut self, id: SourceId) -> Result<()> {
        match self.sources.remove(&id.0) {
            Some(Entry::Timer { fd, .. }) => {
                epoll::delete(&self.epoll, &fd)?;
                Ok(())
            }
            Some(entry @ Entry::Fd { .. }) => {
                self.sources.insert(id.0, entry);
                Err(Error::InvalidParameter)
            }
            None => Err(Error::InvalidParameter),
        }
    }

    /// One dispatch pass: collect every ready source without blocking
    /// beyond `timeout_ms`. Expired timers are read (cleared) here.
    pub fn poll_ready(&mut self, timeout_ms: i32) -> Result<Vec<(T, Readiness)>> {
        let mut events = epoll::EventVec::with_capacity(32);
        match epoll::wait(&self.epoll, &mut events, timeout_ms) {
            Ok(()) => {}
            Err(rustix::io::Errno::INTR) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        }

        let mut ready = Vec::new();
        for event in events.iter() {
            let id = event.data.u64();
            let Some(entry) = self.sources.get(&id) else {
                continue;
            };
            match entry {
                Entry::Fd { token, .. } => {
                    ready.push((*token, readiness_from(event.flags)));
                }
                Entry::Timer { fd, token } => {
                    let mut expirations = [0u8; 8];
                    let _ = rustix::io::read(fd, &mut expirations);
                    ready.push((*token, Readiness::READABLE));
                }
            }
        }
        Ok(ready)
    }
}

fn interest_flags(interest: Readiness) -> epoll::EventFlags {
    let mut flags = epoll::EventFlags::empty();
    if interest.contains(Readiness::READABLE) {
        flags |= epoll::EventFlags::IN;
    }
    if interest.contains(Readiness::WRITABLE) {
        flags |= epoll::EventFlags::OUT;
    }
    flags
}

fn readiness_from(flags: epoll::EventFlags) -> Readiness {
    let mut readiness = Readiness::empty();
    if flags.contains(epoll::EventFlags::IN) {
        readiness |= Readiness::READABLE;
    }
    if flags.contains(epoll::EventFlags::OUT) {
        readiness |= Readiness::WRITABLE;
    }
    if flags.contains(epoll::EventFlags::HUP) {
        readiness |= Readiness::HANGUP;
    }
    if flags.contains(epoll::EventFlags::ERR) {
        readiness |= Readiness::ERROR;
    }
    readiness
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[test]
    fn fd_source_reports_readable() {
        let mut event_loop: EventLoop<u32> = EventLoop::new().unwrap();
        let (read, write) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).unwrap();
        let id = event_loop.add_fd(read.as_fd(), Readiness::READABLE, 7).unwrap();

        assert!(event_loop.poll_ready(0).unwrap().is_empty());

        rustix::io::write(&write, b"x").unwrap();
        let ready = event_loop.poll_ready(100).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].0, 7);
        assert!(ready[0].1.contains(Readiness::READABLE));

        let mut buf = [0u8; 8];
        rustix::io::read(&read, &mut buf).unwrap();
        event_loop.remove_fd(id).unwrap();
        assert!(event_loop.poll_ready(0).unwrap().is_empty());
    }

    #[test]
    fn timer_fires_once_after_delay() {
        let mut event_loop: EventLoop<u32> = EventLoop::new().unwrap();
        let id = event_loop.add_timer(42).unwrap();

        assert!(event_loop.poll_ready(0).unwrap().is_empty(), "disarmed timer is silent");

        event_loop.update_timer(id, 10).unwrap();
        let ready = event_loop.poll_ready(1_000).unwrap();
        assert_eq!(ready, vec![(42, Readiness::READABLE)]);

        // One-shot: stays quiet until re-armed.
        assert!(event_loop.poll_ready(30).unwrap().is_empty());
        event_loop.update_timer(id, 1).unwrap();
        assert_eq!(event_loop.poll_ready(1_000).unwrap().len(), 1);
    }

    #[test]
    fn hangup_is_reported() {
        let mut event_loop: EventLoop<&'static str> = EventLoop::new().unwrap();
        let (read, write) = rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).unwrap();
        event_loop.add_fd(read.as_fd(), Readiness::READABLE, "pipe").unwrap();

        drop(write);
        let ready = event_loop.poll_ready(100).unwrap();
        assert_eq!(ready.len(), 1);
        assert!(ready[0].1.contains(Readiness::HANGUP));
    }
}
