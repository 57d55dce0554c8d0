//! Synthetic traffic generator.
//!
//! Not part of any standard: each connection is sent brief informational
//! messages at a configurable interval, which is handy for exercising
//! firewalls and long-lived-connection handling. A timer stages each message
//! and the write handler drains it, so a stalled peer delays its own traffic
//! without blocking anyone else.
//!
//! Options:
//! - `-i <sec>`: interval between messages (default 1)
//! - `-r <sec>`: extra random amount added to each interval (default 0)
//! - `-n <msgs>`: messages to send before terminating (0 = unlimited)
//! - `-d <sec>`: delay between the last message and termination (default 0)

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::Local;
use mio::net::TcpStream;
use rand::Rng;

use crate::error::SetupError;
use crate::proto::{discard, ArgCursor, ProtocolInstance};
use crate::runtime::conn::{Conn, Driver, Interest, Outcome, Sock};

#[derive(Debug, Clone, Copy)]
struct GenConfig {
    interval: Duration,
    jitter: Duration,
    /// Messages before termination; 0 means run forever.
    max_msgs: u64,
    /// Delay between the final message and close.
    linger: Duration,
}

pub fn construct(args: &mut ArgCursor<'_>) -> Result<Box<dyn ProtocolInstance>, SetupError> {
    let mut cfg = GenConfig {
        interval: Duration::from_secs(1),
        jitter: Duration::ZERO,
        max_msgs: 0,
        linger: Duration::ZERO,
    };

    loop {
        if let Some(v) = args.take_option("-i") {
            cfg.interval = parse_interval("-i", v)?;
        } else if let Some(v) = args.take_option("-r") {
            cfg.jitter = parse_interval("-r", v)?;
        } else if let Some(v) = args.take_option("-n") {
            // A count that does not parse means "unlimited".
            cfg.max_msgs = v.parse().unwrap_or(0);
        } else if let Some(v) = args.take_option("-d") {
            cfg.linger = parse_interval("-d", v)?;
        } else {
            break;
        }
    }

    Ok(Box::new(Gen {
        cfg,
        hostname: hostname(),
    }))
}

fn parse_interval(option: &'static str, arg: &str) -> Result<Duration, SetupError> {
    match arg.parse::<f64>() {
        Ok(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        _ => Err(SetupError::BadProtocolOption {
            proto: "gen",
            option,
            reason: format!("'{arg}' is not a non-negative number of seconds"),
        }),
    }
}

fn hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).ok().map(str::to_owned)
}

pub struct Gen {
    cfg: GenConfig,
    hostname: Option<String>,
}

impl ProtocolInstance for Gen {
    fn new_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        now: Instant,
    ) -> io::Result<Conn> {
        let driver = GenDriver {
            cfg: self.cfg,
            hostname: self.hostname.clone(),
            peer,
            count: 0,
            pending: Vec::new(),
            sent: 0,
            ending: false,
        };
        // First message fires immediately.
        let interest = Interest {
            read: true,
            write: false,
            timer: Some(now),
        };
        Ok(Conn::new(stream, Box::new(driver), interest))
    }
}

struct GenDriver {
    cfg: GenConfig,
    hostname: Option<String>,
    peer: SocketAddr,
    count: u64,
    pending: Vec<u8>,
    sent: usize,
    ending: bool,
}

impl GenDriver {
    fn stage_message(&mut self) {
        let ts = Local::now().format("%F %H:%M:%S%.6f");
        let host = match &self.hostname {
            Some(h) => format!(", host {h}"),
            None => String::new(),
        };
        let msg = format!(
            "{ts} - msg {}, pid {}, peer {}{host}\r\n",
            self.count,
            std::process::id(),
            self.peer,
        );
        self.pending = msg.into_bytes();
        self.sent = 0;
    }

    fn next_deadline(&self) -> Instant {
        let jitter = if self.cfg.jitter > Duration::ZERO {
            rand::thread_rng().gen_range(Duration::ZERO..=self.cfg.jitter)
        } else {
            Duration::ZERO
        };
        Instant::now() + self.cfg.interval + jitter
    }
}

impl Driver for GenDriver {
    fn on_readable(&mut self, sock: &mut Sock, _interest: &mut Interest) -> Outcome {
        discard::drain_read(sock)
    }

    fn on_writable(&mut self, sock: &mut Sock, interest: &mut Interest) -> Outcome {
        if self.sent >= self.pending.len() {
            interest.write = false;
            return Outcome::Ok;
        }
        let step = sock.write_step(&self.pending[self.sent..]);
        step.then(|n| {
            self.sent += n;
            if self.sent < self.pending.len() {
                return Outcome::Ok;
            }
            // Message fully delivered; decide what happens next.
            self.count += 1;
            interest.write = false;
            if self.cfg.max_msgs == 0 || self.count < self.cfg.max_msgs {
                interest.timer = Some(self.next_deadline());
                Outcome::Ok
            } else if self.cfg.linger > Duration::ZERO {
                self.ending = true;
                interest.timer = Some(Instant::now() + self.cfg.linger);
                Outcome::Ok
            } else {
                Outcome::Close
            }
        })
    }

    fn on_timer(&mut self, _sock: &mut Sock, interest: &mut Interest, _now: Instant) -> Outcome {
        if self.ending {
            return Outcome::Close;
        }
        self.stage_message();
        interest.write = true;
        // No new timer until this message is fully written.
        interest.timer = None;
        Outcome::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testutil::stream_pair;
    use std::io::Read as _;

    fn test_driver(cfg: GenConfig) -> GenDriver {
        GenDriver {
            cfg,
            hostname: Some("testhost".to_string()),
            peer: "127.0.0.1:9999".parse().unwrap(),
            count: 0,
            pending: Vec::new(),
            sent: 0,
            ending: false,
        }
    }

    fn flush(driver: &mut GenDriver, sock: &mut Sock, interest: &mut Interest) -> Outcome {
        loop {
            match driver.on_writable(sock, interest) {
                Outcome::Ok if !interest.write => return Outcome::Ok,
                Outcome::Ok => continue,
                Outcome::Transient => {
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => return other,
            }
        }
    }

    #[test]
    fn interval_parsing_accepts_fractions_and_rejects_junk() {
        assert_eq!(parse_interval("-i", "1.5").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_interval("-i", "0").unwrap(), Duration::ZERO);
        assert!(parse_interval("-i", "-1").is_err());
        assert!(parse_interval("-i", "soon").is_err());
    }

    #[test]
    fn unparseable_message_count_means_unlimited() {
        let args: Vec<String> = ["-n", "bogus"].iter().map(|s| s.to_string()).collect();
        let mut cur = ArgCursor::new(&args);
        assert!(construct(&mut cur).is_ok());
    }

    #[test]
    fn emits_exactly_n_messages_then_closes() {
        let (stream, mut peer) = stream_pair();
        let mut sock = Sock::new(stream);
        let mut interest = Interest {
            read: true,
            write: false,
            timer: Some(Instant::now()),
        };
        let mut driver = test_driver(GenConfig {
            interval: Duration::from_millis(1),
            jitter: Duration::ZERO,
            max_msgs: 3,
            linger: Duration::ZERO,
        });

        let mut messages = 0;
        let closed = loop {
            match driver.on_timer(&mut sock, &mut interest, Instant::now()) {
                Outcome::Close => break true,
                Outcome::Ok => {}
                _ => panic!("unexpected timer outcome"),
            }
            assert!(interest.write);
            match flush(&mut driver, &mut sock, &mut interest) {
                Outcome::Ok => {
                    messages += 1;
                    assert!(interest.timer.is_some());
                }
                Outcome::Close => {
                    messages += 1;
                    break true;
                }
                _ => panic!("unexpected write outcome"),
            }
            if messages > 3 {
                break false;
            }
        };

        assert!(closed);
        assert_eq!(messages, 3);

        drop(sock);
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut out = String::new();
        peer.read_to_string(&mut out).unwrap();
        assert_eq!(out.matches("\r\n").count(), 3);
        assert!(out.contains("msg 0,"));
        assert!(out.contains("msg 2,"));
        assert!(out.contains("host testhost"));
    }

    #[test]
    fn linger_arms_a_final_timer_before_close() {
        let (stream, _peer) = stream_pair();
        let mut sock = Sock::new(stream);
        let mut interest = Interest {
            read: true,
            write: false,
            timer: Some(Instant::now()),
        };
        let mut driver = test_driver(GenConfig {
            interval: Duration::from_millis(1),
            jitter: Duration::ZERO,
            max_msgs: 1,
            linger: Duration::from_millis(10),
        });

        assert!(matches!(
            driver.on_timer(&mut sock, &mut interest, Instant::now()),
            Outcome::Ok
        ));
        assert!(matches!(
            flush(&mut driver, &mut sock, &mut interest),
            Outcome::Ok
        ));
        // The termination timer is armed rather than closing outright.
        assert!(driver.ending);
        assert!(interest.timer.is_some());
        assert!(matches!(
            driver.on_timer(&mut sock, &mut interest, Instant::now()),
            Outcome::Close
        ));
    }
}
