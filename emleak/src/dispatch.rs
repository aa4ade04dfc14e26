//! The request/reply loop.

use crate::error::*;
use crate::request::WireRequest;
use crate::transport::Transport;
use crate::trigger::Trigger;
use crate::variant::*;
use std::convert::Infallible;
use tracing::{ info, trace, warn };

/// Size of the receive buffer. Longer datagrams are truncated.
pub const RECV_BUF_LEN: usize = 64;

/// What happened to a single datagram.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Served {
    /// Number of bytes received (and echoed).
    pub len: usize,
    /// `None` when the datagram didn't have the length of a request.
    pub outcome: Option<LeakOutcome>,
}

/// Runs one [`LeakVariant`] over a [`Transport`], framing each leak attempt
/// with a [`Trigger`].
///
/// Every datagram gets a reply holding exactly the bytes received, whether
/// or not it decoded into a request. Nothing is logged between receiving a
/// request and sending its reply.
pub struct Dispatcher<V: LeakVariant, X: Trigger, T: Transport> {
    ctx: LeakContext,
    variant: V,
    trigger: X,
    transport: T,
    buf: [u8; RECV_BUF_LEN],
    started: bool,
}

impl<V: LeakVariant, X: Trigger, T: Transport> Dispatcher<V, X, T> {
    pub fn new(ctx: LeakContext, variant: V, trigger: X, transport: T) -> Self {
        Self {
            ctx, variant, trigger, transport,
            buf: [0; RECV_BUF_LEN],
            started: false,
        }
    }

    pub fn context(&self) -> &LeakContext { &self.ctx }
    pub fn variant(&self) -> &V { &self.variant }
    pub fn trigger(&self) -> &X { &self.trigger }
    pub fn transport(&self) -> &T { &self.transport }

    /// Put the trigger into its idle state. Called implicitly by the first
    /// [`Dispatcher::serve_one`].
    pub fn start(&mut self) {
        if !self.started {
            self.variant.on_start(&mut self.trigger);
            self.started = true;
        }
    }

    /// Block for one datagram, run the leak attempt and reply.
    pub fn serve_one(&mut self) -> Result<Served, DispatchError> {
        self.start();

        let len = self.transport.recv(&mut self.buf)
            .map_err(DispatchError::Receive)?;

        let outcome = match V::Request::decode(&self.buf[..len]) {
            Some(req) => Some(self.variant.execute(&self.ctx, &mut self.trigger, &req)?),
            None => None,
        };

        let reply = self.transport.reply(&self.buf[..len]);
        self.variant.after_reply(&mut self.trigger, outcome);
        reply.map_err(DispatchError::Reply)?;

        trace!(variant = V::NAME, len, ?outcome,
            pulse = ?self.trigger.last_pulse(), "served request");
        Ok(Served { len, outcome })
    }

    /// Serve requests forever. Only returns on a fatal error.
    pub fn run(&mut self) -> TargetResult<Infallible> {
        info!(variant = V::NAME, request_len = V::Request::LEN,
            "waiting for requests");
        self.start();
        loop {
            match self.serve_one() {
                Ok(_) => {},
                Err(DispatchError::Integrity(e)) => return Err(e),
                Err(e) => warn!("{}", e),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::TargetConfig;
    use crate::request::*;
    use crate::trigger::PulseRecorder;
    use std::collections::VecDeque;
    use std::io;

    /// An in-memory transport. Each queued request is either a datagram or
    /// an error to return from `recv`.
    #[derive(Default)]
    struct Loopback {
        requests: VecDeque<io::Result<Vec<u8>>>,
        replies: Vec<Vec<u8>>,
        fail_reply: bool,
    }

    impl Loopback {
        fn push(&mut self, buf: Vec<u8>) { self.requests.push_back(Ok(buf)); }
    }

    impl Transport for Loopback {
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.requests.pop_front() {
                Some(Ok(req)) => {
                    let len = req.len().min(buf.len());
                    buf[..len].copy_from_slice(&req[..len]);
                    Ok(len)
                },
                Some(Err(e)) => Err(e),
                None => Err(io::Error::new(io::ErrorKind::WouldBlock, "empty")),
            }
        }
        fn reply(&mut self, buf: &[u8]) -> io::Result<()> {
            if self.fail_reply {
                return Err(io::Error::new(io::ErrorKind::Other, "unreachable"));
            }
            self.replies.push(buf.to_vec());
            Ok(())
        }
    }

    fn context() -> LeakContext {
        let cfg = TargetConfig::default().thrash_len(64 * 1024).thrash_passes(1);
        LeakContext::new(&cfg).unwrap()
    }

    #[test]
    fn echoes_request() {
        let mut t = Loopback::default();
        let req = BitRequest { bit: BitIndex(0) }.encode();
        t.push(req.clone());
        let mut d = Dispatcher::new(context(),
            ControlFlowLeak::new(CountingTransmitter::default()),
            PulseRecorder::new(), t);

        let served = d.serve_one().unwrap();
        assert_eq!(served, Served { len: 4, outcome: Some(LeakOutcome::Leaked) });
        assert_eq!(d.transport().replies, vec![req]);
        assert_eq!(d.trigger().pulses().len(), 1);
    }

    #[test]
    fn wrong_length_is_echoed_without_leak() {
        let mut t = Loopback::default();
        t.push(vec![1, 2, 3]);
        t.push(vec![0; 8]);
        let mut d = Dispatcher::new(context(),
            ControlFlowLeak::new(CountingTransmitter::default()),
            PulseRecorder::new(), t);

        assert_eq!(d.serve_one().unwrap(), Served { len: 3, outcome: None });
        assert_eq!(d.serve_one().unwrap(), Served { len: 8, outcome: None });
        assert_eq!(d.transport().replies, vec![vec![1, 2, 3], vec![0; 8]]);
        assert!(d.trigger().edges().is_empty());
    }

    #[test]
    fn io_errors_are_not_fatal() {
        let mut t = Loopback::default();
        t.requests.push_back(Err(io::Error::new(io::ErrorKind::Interrupted, "eintr")));
        t.push(BitRequest { bit: BitIndex(3) }.encode());
        let mut d = Dispatcher::new(context(),
            OperandLeak::new(CountingTransmitter::default()),
            PulseRecorder::new(), t);

        let e = d.serve_one().unwrap_err();
        assert!(matches!(e, DispatchError::Receive(_)));
        assert!(!e.is_fatal());
        assert!(d.serve_one().is_ok());
        assert_eq!(d.variant().transmitter().operands.len(), 1);
    }

    #[test]
    fn failed_reply_still_rearms_trigger() {
        let mut t = Loopback::default();
        t.fail_reply = true;
        t.push(ModeRequest { bit: BitIndex(0), option: 0 }.encode());
        let mut d = Dispatcher::new(context(),
            NoFlushLeak::new(CountingTransmitter::default()),
            PulseRecorder::new(), t);

        let e = d.serve_one().unwrap_err();
        assert!(matches!(e, DispatchError::Reply(_)));
        assert_eq!(d.trigger().level(), crate::trigger::Level::High);
        assert_eq!(d.trigger().pulses().len(), 1);
    }

    #[test]
    fn identical_requests_are_idempotent() {
        let mut t = Loopback::default();
        let req = RegisterRequest {
            bit: BitIndex(39),
            selector: RegisterSelector::TTBR0_EL1.encoding(),
        }.encode();
        for _ in 0..16 {
            t.push(req.clone());
        }
        let mut d = Dispatcher::new(context(),
            RegisterLeak::new(crate::gadget::SoftwareGadget::new().unwrap()),
            PulseRecorder::new(), t);

        let store = d.context().store.data().to_vec();
        let chain: Vec<usize> = (0..d.context().chain.links())
            .map(|i| d.context().chain.value(i))
            .collect();
        let mut code = None;
        for _ in 0..16 {
            d.serve_one().unwrap();
            let words = d.variant().gadget().code().words().to_vec();
            if let Some(prev) = &code {
                assert_eq!(prev, &words);
            }
            code = Some(words);
        }
        assert!(d.transport().replies.iter().all(|r| r == &req));
        assert_eq!(d.transport().replies.len(), 16);
        assert_eq!(d.context().store.data(), &store[..]);
        let after: Vec<usize> = (0..d.context().chain.links())
            .map(|i| d.context().chain.value(i))
            .collect();
        assert_eq!(after, chain);
    }
}
