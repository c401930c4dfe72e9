use std::{
    io::{Cursor, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::RwLock;
use tracing::{debug, error};

use super::envelope::{GroupMessage, GroupView, MemberAddress, Plane};
use crate::{
    error::{MeshResult, MultiplexError},
    metrics::MeshMetrics,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Physical group-communication channel shared by both planes.
pub trait GroupChannel: Send + Sync {
    /// This member's address, once connected to the group.
    fn local_address(&self) -> Option<MemberAddress>;

    fn send(&self, message: GroupMessage) -> Result<(), MultiplexError>;

    fn discard_own_messages(&self) -> bool;

    fn set_discard_own_messages(&self, discard: bool);
}

/// Consumer of one plane's traffic and group events.
pub trait ChannelReceiver: Send + Sync {
    fn receive(&self, message: GroupMessage);

    fn view_accepted(&self, _view: &GroupView) {}

    fn suspect(&self, _member: &MemberAddress) {}

    fn block(&self) {}

    fn unblock(&self) {}

    /// Write this member's state for a joining member.
    fn get_state(&self, _out: &mut dyn Write) -> Result<(), BoxError> {
        Ok(())
    }

    /// Replace local state with state transferred from another member.
    fn set_state(&self, _input: &mut dyn Read) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Events delivered up from the group stack.
pub enum ChannelEvent {
    Message(GroupMessage),
    ViewChange(GroupView),
    Suspect(MemberAddress),
    /// State requested earlier arrived in one buffer
    GetStateOk(Option<Vec<u8>>),
    /// State requested earlier arrives as a stream
    StateTransferStream(Option<Box<dyn Read + Send>>),
    /// Another member asks for this member's state
    GetApplState,
    Block,
    Unblock,
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelEvent::Message(message) => f.debug_tuple("Message").field(message).finish(),
            ChannelEvent::ViewChange(view) => f.debug_tuple("ViewChange").field(view).finish(),
            ChannelEvent::Suspect(member) => f.debug_tuple("Suspect").field(member).finish(),
            ChannelEvent::GetStateOk(state) => f
                .debug_tuple("GetStateOk")
                .field(&state.as_ref().map(Vec::len))
                .finish(),
            ChannelEvent::StateTransferStream(stream) => f
                .debug_tuple("StateTransferStream")
                .field(&stream.is_some())
                .finish(),
            ChannelEvent::GetApplState => f.write_str("GetApplState"),
            ChannelEvent::Block => f.write_str("Block"),
            ChannelEvent::Unblock => f.write_str("Unblock"),
        }
    }
}

/// What `up` hands back to the group stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpReply {
    /// No control receiver is registered; the event was not consumed.
    Ignored,
    Done,
    /// Acknowledges a `Block` event.
    Blocked,
    /// Serialized application state answering `GetApplState`.
    State(Vec<u8>),
}

/// Splits one physical [`GroupChannel`] into a control plane and a data plane.
///
/// Control messages sent through this channel carry the control marker; the
/// receive side routes marked messages to the control receiver and everything
/// else to the data receiver. Group events (views, suspicions, state transfer)
/// belong to the control plane only, except block/unblock which both planes
/// see, control first.
///
/// Each plane has its own "discard own messages" flag. The data plane's flag is
/// read from the physical channel at construction and fixed from then on; the
/// physical channel itself is switched to deliver everything so both planes can
/// filter independently.
pub struct ControlChannel {
    channel: Arc<dyn GroupChannel>,
    receiver: RwLock<Option<Arc<dyn ChannelReceiver>>>,
    data_receiver: RwLock<Option<Arc<dyn ChannelReceiver>>>,
    data_discard_own: bool,
    discard_own: AtomicBool,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("local", &self.channel.local_address())
            .field("data_discard_own", &self.data_discard_own)
            .field("discard_own", &self.discard_own.load(Ordering::Relaxed))
            .finish()
    }
}

impl ControlChannel {
    pub fn new(channel: Arc<dyn GroupChannel>) -> Self {
        let data_discard_own = channel.discard_own_messages();
        channel.set_discard_own_messages(false);
        Self {
            channel,
            receiver: RwLock::new(None),
            data_receiver: RwLock::new(None),
            data_discard_own,
            discard_own: AtomicBool::new(false),
        }
    }

    pub fn set_receiver(&self, receiver: Arc<dyn ChannelReceiver>) {
        *self.receiver.write() = Some(receiver);
    }

    pub fn set_data_receiver(&self, receiver: Arc<dyn ChannelReceiver>) {
        *self.data_receiver.write() = Some(receiver);
    }

    pub fn data_discard_own_messages(&self) -> bool {
        self.data_discard_own
    }

    fn is_own(&self, message: &GroupMessage, discard: bool) -> bool {
        if !discard {
            return false;
        }
        match (self.channel.local_address(), &message.src) {
            (Some(local), Some(src)) => local == *src,
            _ => false,
        }
    }

    /// Route one event from the group stack.
    pub fn up(&self, event: ChannelEvent) -> MeshResult<UpReply> {
        let Some(receiver) = self.receiver.read().clone() else {
            debug!(?event, "No control receiver, event ignored");
            return Ok(UpReply::Ignored);
        };
        let data_receiver = self.data_receiver.read().clone();

        match event {
            ChannelEvent::Message(message) => match message.plane {
                Plane::Control => {
                    if !self.is_own(&message, self.discard_own.load(Ordering::Acquire)) {
                        MeshMetrics::record_demuxed(Plane::Control.as_str());
                        receiver.receive(message);
                    }
                }
                Plane::Data => {
                    if let Some(data) = data_receiver {
                        if !self.is_own(&message, self.data_discard_own) {
                            MeshMetrics::record_demuxed(Plane::Data.as_str());
                            data.receive(message);
                        }
                    }
                }
            },
            ChannelEvent::ViewChange(view) => receiver.view_accepted(&view),
            ChannelEvent::Suspect(member) => receiver.suspect(&member),
            ChannelEvent::GetStateOk(state) => {
                if let Some(state) = state {
                    receiver
                        .set_state(&mut Cursor::new(state))
                        .map_err(|e| MultiplexError::StateApply(e.to_string()))?;
                }
            }
            ChannelEvent::StateTransferStream(stream) => {
                if let Some(mut stream) = stream {
                    receiver.set_state(&mut stream).map_err(|e| {
                        error!("Error while setting state: {}", e);
                        MultiplexError::StateApply(format!(
                            "failed calling set_state in state requester: {e}"
                        ))
                    })?;
                }
            }
            ChannelEvent::GetApplState => {
                let mut out = Vec::with_capacity(1024);
                receiver.get_state(&mut out).map_err(|e| {
                    error!("Error while getting state: {}", e);
                    let local = self
                        .channel
                        .local_address()
                        .map(|a| a.to_string())
                        .unwrap_or_default();
                    MultiplexError::StateProduce(format!(
                        "{local}: failed getting state from application: {e}"
                    ))
                })?;
                return Ok(UpReply::State(out));
            }
            ChannelEvent::Block => {
                receiver.block();
                if let Some(data) = data_receiver {
                    data.block();
                }
                return Ok(UpReply::Blocked);
            }
            ChannelEvent::Unblock => {
                receiver.unblock();
                if let Some(data) = data_receiver {
                    data.unblock();
                }
            }
        }
        Ok(UpReply::Done)
    }
}

impl GroupChannel for ControlChannel {
    fn local_address(&self) -> Option<MemberAddress> {
        self.channel.local_address()
    }

    /// Send on the control plane.
    fn send(&self, mut message: GroupMessage) -> Result<(), MultiplexError> {
        message.plane = Plane::Control;
        self.channel.send(message)
    }

    fn discard_own_messages(&self) -> bool {
        self.discard_own.load(Ordering::Acquire)
    }

    fn set_discard_own_messages(&self, discard: bool) {
        self.discard_own.store(discard, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use parking_lot::Mutex;

    use super::*;

    struct FakeChannel {
        local: MemberAddress,
        discard: AtomicBool,
        sent: Mutex<Vec<GroupMessage>>,
    }

    impl FakeChannel {
        fn new(local: &str, discard: bool) -> Arc<Self> {
            Arc::new(Self {
                local: local.into(),
                discard: AtomicBool::new(discard),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl GroupChannel for FakeChannel {
        fn local_address(&self) -> Option<MemberAddress> {
            Some(self.local.clone())
        }

        fn send(&self, message: GroupMessage) -> Result<(), MultiplexError> {
            self.sent.lock().push(message);
            Ok(())
        }

        fn discard_own_messages(&self) -> bool {
            self.discard.load(Ordering::SeqCst)
        }

        fn set_discard_own_messages(&self, discard: bool) {
            self.discard.store(discard, Ordering::SeqCst);
        }
    }

    /// Records everything it sees into a log shared across receivers.
    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        state: Mutex<Vec<u8>>,
        fail_state: bool,
    }

    impl Recorder {
        fn new(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                log: log.clone(),
                state: Mutex::new(Vec::new()),
                fail_state: false,
            })
        }

        fn failing(tag: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                tag,
                log: log.clone(),
                state: Mutex::new(Vec::new()),
                fail_state: true,
            })
        }

        fn push(&self, what: String) {
            self.log.lock().push(format!("{}:{}", self.tag, what));
        }
    }

    impl ChannelReceiver for Recorder {
        fn receive(&self, message: GroupMessage) {
            self.push(String::from_utf8_lossy(&message.payload).into_owned());
        }

        fn view_accepted(&self, view: &GroupView) {
            self.push(format!("view {}", view.view_id));
        }

        fn suspect(&self, member: &MemberAddress) {
            self.push(format!("suspect {member}"));
        }

        fn block(&self) {
            self.push("block".to_string());
        }

        fn unblock(&self) {
            self.push("unblock".to_string());
        }

        fn get_state(&self, out: &mut dyn Write) -> Result<(), BoxError> {
            if self.fail_state {
                return Err(Box::new(io::Error::other("disk gone")));
            }
            out.write_all(b"snapshot")?;
            Ok(())
        }

        fn set_state(&self, input: &mut dyn Read) -> Result<(), BoxError> {
            if self.fail_state {
                return Err("corrupt state".into());
            }
            input.read_to_end(&mut self.state.lock())?;
            Ok(())
        }
    }

    fn message(plane: Plane, src: &str, payload: &'static [u8]) -> ChannelEvent {
        let mut message = GroupMessage::data(payload).from_member(src.into());
        message.plane = plane;
        ChannelEvent::Message(message)
    }

    fn wired(physical_discard: bool) -> (ControlChannel, Arc<FakeChannel>, Arc<Mutex<Vec<String>>>) {
        let physical = FakeChannel::new("A", physical_discard);
        let channel = ControlChannel::new(physical.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.set_receiver(Recorder::new("control", &log));
        channel.set_data_receiver(Recorder::new("data", &log));
        (channel, physical, log)
    }

    #[test]
    fn test_construction_captures_data_discard() {
        let (channel, physical, _log) = wired(true);
        assert!(channel.data_discard_own_messages());
        assert!(!physical.discard_own_messages());
        assert!(!channel.discard_own_messages());
    }

    #[test]
    fn test_send_marks_control_plane() {
        let (channel, physical, _log) = wired(false);
        channel
            .send(GroupMessage::data(&b"hello"[..]).to("B".into()))
            .unwrap();
        let sent = physical.sent.lock();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_control());
        assert_eq!(sent[0].dest, Some("B".into()));
    }

    #[test]
    fn test_messages_demux_by_marker() {
        let (channel, _physical, log) = wired(false);
        channel.up(message(Plane::Control, "B", b"c1")).unwrap();
        channel.up(message(Plane::Data, "B", b"d1")).unwrap();
        assert_eq!(*log.lock(), vec!["control:c1", "data:d1"]);
    }

    #[test]
    fn test_discard_flags_are_independent() {
        // Data plane discards own messages, control plane does not
        let (channel, _physical, log) = wired(true);
        channel.up(message(Plane::Control, "A", b"own-control")).unwrap();
        channel.up(message(Plane::Data, "A", b"own-data")).unwrap();
        channel.up(message(Plane::Data, "B", b"peer-data")).unwrap();
        assert_eq!(*log.lock(), vec!["control:own-control", "data:peer-data"]);

        // And the other way round
        let (channel, _physical, log) = wired(false);
        channel.set_discard_own_messages(true);
        channel.up(message(Plane::Control, "A", b"own-control")).unwrap();
        channel.up(message(Plane::Control, "B", b"peer-control")).unwrap();
        channel.up(message(Plane::Data, "A", b"own-data")).unwrap();
        assert_eq!(*log.lock(), vec!["control:peer-control", "data:own-data"]);
    }

    #[test]
    fn test_group_events_go_to_control_only() {
        let (channel, _physical, log) = wired(false);
        channel
            .up(ChannelEvent::ViewChange(GroupView {
                view_id: 7,
                members: vec!["A".into(), "B".into()],
            }))
            .unwrap();
        channel.up(ChannelEvent::Suspect("B".into())).unwrap();
        assert_eq!(*log.lock(), vec!["control:view 7", "control:suspect B"]);
    }

    #[test]
    fn test_block_reaches_control_then_data() {
        let (channel, _physical, log) = wired(false);
        assert_eq!(channel.up(ChannelEvent::Block).unwrap(), UpReply::Blocked);
        assert_eq!(channel.up(ChannelEvent::Unblock).unwrap(), UpReply::Done);
        assert_eq!(
            *log.lock(),
            vec!["control:block", "data:block", "control:unblock", "data:unblock"]
        );
    }

    #[test]
    fn test_state_transfer_uses_control_receiver() {
        let physical = FakeChannel::new("A", false);
        let channel = ControlChannel::new(physical);
        let log = Arc::new(Mutex::new(Vec::new()));
        let control = Recorder::new("control", &log);
        channel.set_receiver(control.clone());

        assert_eq!(
            channel.up(ChannelEvent::GetApplState).unwrap(),
            UpReply::State(b"snapshot".to_vec())
        );

        channel
            .up(ChannelEvent::GetStateOk(Some(b"remote".to_vec())))
            .unwrap();
        assert_eq!(*control.state.lock(), b"remote");

        channel
            .up(ChannelEvent::StateTransferStream(Some(Box::new(Cursor::new(
                b"-streamed".to_vec(),
            )))))
            .unwrap();
        assert_eq!(*control.state.lock(), b"remote-streamed");

        // Empty transfers leave state untouched
        channel.up(ChannelEvent::GetStateOk(None)).unwrap();
        assert_eq!(*control.state.lock(), b"remote-streamed");
    }

    #[test]
    fn test_state_failures_escalate() {
        let physical = FakeChannel::new("A", false);
        let channel = ControlChannel::new(physical);
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.set_receiver(Recorder::failing("control", &log));

        assert!(matches!(
            channel.up(ChannelEvent::GetApplState),
            Err(crate::error::MeshError::Multiplex(MultiplexError::StateProduce(_)))
        ));
        assert!(matches!(
            channel.up(ChannelEvent::GetStateOk(Some(vec![1, 2]))),
            Err(crate::error::MeshError::Multiplex(MultiplexError::StateApply(_)))
        ));
        assert!(matches!(
            channel.up(ChannelEvent::StateTransferStream(Some(Box::new(io::empty())))),
            Err(crate::error::MeshError::Multiplex(MultiplexError::StateApply(_)))
        ));
    }

    #[test]
    fn test_without_control_receiver_nothing_is_delivered() {
        let physical = FakeChannel::new("A", false);
        let channel = ControlChannel::new(physical);
        let log = Arc::new(Mutex::new(Vec::new()));
        channel.set_data_receiver(Recorder::new("data", &log));

        assert_eq!(
            channel.up(message(Plane::Data, "B", b"d")).unwrap(),
            UpReply::Ignored
        );
        assert!(log.lock().is_empty());
    }
}
