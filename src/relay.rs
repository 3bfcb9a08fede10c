//! The event multiplexer: one task, one readiness wait per turn, and a table
//! of registrations tagged with the behaviour to run when they become ready.

use log::{debug, info, trace, warn};
use std::collections::{BTreeMap, HashMap};
use std::future::{poll_fn, Future};
use std::io::{Error, Result};
use std::os::fd::{AsRawFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Sleep;

use super::buffer::DEFAULT_CAPACITY;
use super::compositor::{self, Connector};
use super::config::Config;
use super::conn::Conn;
use super::endpoint::{Direction, Flow};
use super::listener::{ListenAddr, Listener};
use super::session::{Session, SessionId, Side};

// Never reused, so events for torn-down sessions can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(u64);

#[derive(Debug, Clone, Copy)]
enum Tag {
    Listener,
    Forward { session: SessionId, side: Side },
}

#[derive(Debug)]
struct Registration {
    fd: RawFd,
    tag: Tag,
}

#[derive(Debug)]
enum Event {
    Incoming(Result<Conn>),
    Ready {
        token: Token,
        readable: bool,
        writable: bool,
    },
    // Socket error noticed on a side that is not being read.
    Failed {
        token: Token,
        error: Error,
    },
}

pub struct Relay {
    listener: Listener,
    connector: Connector,
    buffer_size: usize,
    accept_backoff: Duration,
    // Set while accepting is paused after descriptor exhaustion.
    paused: Option<Pin<Box<Sleep>>>,
    registrations: BTreeMap<Token, Registration>,
    sessions: HashMap<SessionId, Session>,
    next_token: u64,
    next_session: SessionId,
}

impl Relay {
    pub fn new(listener: Listener, connector: Connector) -> Self {
        let mut relay = Relay {
            listener,
            connector,
            buffer_size: DEFAULT_CAPACITY,
            accept_backoff: Duration::from_millis(100),
            paused: None,
            registrations: BTreeMap::new(),
            sessions: HashMap::new(),
            next_token: 0,
            next_session: 0,
        };
        let fd = relay.listener.as_raw_fd();
        relay.register(fd, Tag::Listener);
        relay
    }

    pub async fn bind(config: &Config) -> Result<Self> {
        let addr: ListenAddr = config.listen.parse()?;
        let socket = compositor::resolve_socket(config.compositor.as_deref())
            .map_err(|err| Error::new(err.kind(), format!("compositor socket: {}", err)))?;
        let listener = Listener::bind(&addr).await.map_err(|err| {
            Error::new(err.kind(), format!("failed to listen on {}: {}", addr, err))
        })?;

        info!("Listening on {}", listener.local_addr()?);
        info!("Forwarding to compositor at {}", socket.display());
        if let ListenAddr::Tcp(_) = addr {
            info!("TCP clients cannot pass file descriptors; use a unix: listen address for shm clients");
        }

        Ok(Relay::new(listener, Connector::new(socket))
            .buffer_size(config.buffer_size)
            .accept_backoff(config.accept_backoff))
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        assert!(size > 0, "buffer size must be non-zero");
        self.buffer_size = size;
        self
    }

    pub fn accept_backoff(mut self, backoff: Duration) -> Self {
        self.accept_backoff = backoff;
        self
    }

    pub fn local_addr(&self) -> Result<ListenAddr> {
        self.listener.local_addr()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn is_registered(&self, fd: RawFd) -> bool {
        self.registrations.values().any(|reg| reg.fd == fd)
    }

    pub fn registered_fds(&self) -> Vec<RawFd> {
        self.registrations.values().map(|reg| reg.fd).collect()
    }

    pub async fn run(&mut self) {
        loop {
            self.turn().await;
        }
    }

    /// Waits for one batch of readiness events and dispatches all of it.
    pub async fn turn(&mut self) {
        let events = poll_fn(|cx| self.poll_events(cx)).await;
        trace!("dispatching {} events", events.len());
        for event in events {
            self.dispatch(event);
        }
    }

    fn register(&mut self, fd: RawFd, tag: Tag) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.registrations.insert(token, Registration { fd, tag });
        token
    }

    fn poll_events(&mut self, cx: &mut Context<'_>) -> Poll<Vec<Event>> {
        if let Some(sleep) = self.paused.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                debug!("resuming accept");
                self.paused = None;
            }
        }

        let mut events = Vec::new();
        for (&token, reg) in &self.registrations {
            match reg.tag {
                Tag::Listener => {
                    if self.paused.is_some() {
                        continue;
                    }
                    if let Poll::Ready(result) = self.listener.poll_accept(cx) {
                        events.push(Event::Incoming(result));
                    }
                }
                Tag::Forward { session, side } => {
                    let Some(session) = self.sessions.get_mut(&session) else {
                        continue;
                    };
                    // Only ask for what the endpoints can act on, otherwise a
                    // full buffer or an empty one would spin the loop. A side
                    // with a full reader is still watched for errors.
                    let readable = if session.wants_read(side) {
                        session.is_parked(side)
                            || session.conn(side).poll_read_ready(cx).is_ready()
                    } else {
                        if let Some(error) = session.poll_read_error(side, cx) {
                            events.push(Event::Failed { token, error });
                            continue;
                        }
                        false
                    };
                    let writable = session.wants_write(side)
                        && session.conn(side).poll_write_ready(cx).is_ready();
                    if readable || writable {
                        events.push(Event::Ready {
                            token,
                            readable,
                            writable,
                        });
                    }
                }
            }
        }

        if events.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(events)
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Incoming(result) => self.accept(result),
            Event::Ready {
                token,
                readable,
                writable,
            } => {
                let Some(&Registration {
                    tag: Tag::Forward { session, side },
                    ..
                }) = self.registrations.get(&token)
                else {
                    trace!("ignoring stale event for {:?}", token);
                    return;
                };
                self.service(session, |s| s.on_ready(side, readable, writable));
            }
            Event::Failed { token, error } => {
                let Some(&Registration {
                    tag: Tag::Forward { session, side },
                    ..
                }) = self.registrations.get(&token)
                else {
                    return;
                };
                debug!("Session {}: {} socket failed while stalled", session, side);
                self.service(session, |_| Err(error));
            }
        }
    }

    fn accept(&mut self, result: Result<Conn>) {
        match result {
            Ok(client) => self.establish(client),
            Err(err) if is_resource_exhaustion(&err) => {
                warn!(
                    "Failed to accept: {}, pausing for {}",
                    err,
                    humantime::format_duration(self.accept_backoff)
                );
                self.paused = Some(Box::pin(tokio::time::sleep(self.accept_backoff)));
            }
            Err(err) => warn!("Failed to accept: {}", err),
        }
    }

    fn establish(&mut self, client: Conn) {
        let compositor = match self.connector.connect() {
            Ok(stream) => Conn::from(stream),
            Err(err) => {
                // Dropping the client closes its connection.
                warn!(
                    "Failed to connect to compositor at {}: {}",
                    self.connector.path().display(),
                    err
                );
                return;
            }
        };

        let id = self.next_session;
        self.next_session += 1;

        let session = Session::new(id, client, compositor, self.buffer_size);
        self.register(
            session.fd(Side::Client),
            Tag::Forward {
                session: id,
                side: Side::Client,
            },
        );
        self.register(
            session.fd(Side::Compositor),
            Tag::Forward {
                session: id,
                side: Side::Compositor,
            },
        );
        self.sessions.insert(id, session);
        info!("Session {} opened", id);

        self.service(id, Session::start);
    }

    fn service<F>(&mut self, id: SessionId, f: F)
    where
        F: FnOnce(&mut Session) -> Result<Flow>,
    {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        match f(session) {
            Ok(Flow::Open) => (),
            Ok(Flow::Closed) => {
                debug!("Session {}: peer closed the connection", id);
                self.teardown(id);
            }
            Err(err) => {
                warn!("Session {}: {}", id, err);
                self.teardown(id);
            }
        }
    }

    fn teardown(&mut self, id: SessionId) {
        self.registrations.retain(|_, reg| match reg.tag {
            Tag::Forward { session, .. } => session != id,
            Tag::Listener => true,
        });

        // Dropping the session closes both connections along with any
        // descriptors still waiting in its buffers.
        if let Some(session) = self.sessions.remove(&id) {
            let up = session.endpoint(Direction::Upstream);
            let down = session.endpoint(Direction::Downstream);
            debug!(
                "Session {}: {} bytes/{} fds upstream, {} bytes/{} fds downstream, {} bytes discarded",
                id,
                up.forwarded_bytes(),
                up.forwarded_fds(),
                down.forwarded_bytes(),
                down.forwarded_fds(),
                up.buffer().len() + down.buffer().len(),
            );
            info!("Session {} closed", id);
        }
    }
}

fn is_resource_exhaustion(err: &Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::ErrorKind;

    async fn relay() -> (Relay, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let listener = Listener::bind(&"127.0.0.1:0".parse().unwrap()).await.unwrap();
        let relay = Relay::new(listener, Connector::new(dir.path().join("wayland-0")));
        (relay, dir)
    }

    #[test]
    fn classifies_descriptor_exhaustion() {
        assert!(is_resource_exhaustion(&Error::from_raw_os_error(libc::EMFILE)));
        assert!(is_resource_exhaustion(&Error::from_raw_os_error(libc::ENFILE)));
        assert!(!is_resource_exhaustion(&Error::from_raw_os_error(libc::ECONNABORTED)));
        assert!(!is_resource_exhaustion(&Error::from(ErrorKind::Other)));
    }

    #[tokio::test]
    async fn bind_failure_names_the_listen_address() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let config = Config {
            listen: taken.local_addr().unwrap().to_string(),
            compositor: Some("/run/wayland-test".to_owned()),
            ..Config::default()
        };
        let err = match Relay::bind(&config).await {
            Ok(_) => panic!("bound an address already in use"),
            Err(err) => err,
        };
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
        assert!(err.to_string().starts_with("failed to listen on 127.0.0.1:"));
    }

    #[tokio::test]
    async fn listener_is_registered_from_the_start() {
        let (relay, _dir) = relay().await;
        assert_eq!(relay.registered_fds(), vec![relay.listener.as_raw_fd()]);
        assert_eq!(relay.session_count(), 0);
    }

    #[tokio::test]
    async fn stale_events_are_ignored() {
        let (mut relay, _dir) = relay().await;
        relay.dispatch(Event::Ready {
            token: Token(42),
            readable: true,
            writable: true,
        });
        relay.dispatch(Event::Ready {
            token: Token(0),
            readable: true,
            writable: false,
        });
        assert_eq!(relay.registered_fds().len(), 1);
    }

    #[tokio::test]
    async fn exhaustion_pauses_accepting() {
        let (mut relay, _dir) = relay().await;
        relay.accept(Err(Error::from_raw_os_error(libc::EMFILE)));
        assert!(relay.paused.is_some());

        relay.accept(Err(Error::from_raw_os_error(libc::ECONNABORTED)));
        assert!(relay.is_registered(relay.listener.as_raw_fd()));
    }

    #[tokio::test]
    async fn accepting_resumes_after_backoff() {
        let (relay, _dir) = relay().await;
        let mut relay = relay.accept_backoff(Duration::from_millis(50));
        relay.accept(Err(Error::from_raw_os_error(libc::EMFILE)));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let polled = poll_fn(|cx| Poll::Ready(relay.poll_events(cx))).await;
        assert!(polled.is_pending());
        assert!(relay.paused.is_none());
    }
}
