//! Class tokens: compact 16-bit tags identifying an object's type and its
//! ancestors, used for safe fast downcasting out of the handle table.
//!
//! The low byte holds the base-class bits, the high byte the final-class
//! bits. A type derives from another exactly when it carries all of the
//! ancestor's bits, so `is-a` is a mask test against a lookup table keyed by
//! [`ObjectKind`] rather than compile-time bit arithmetic.

/// Discriminant for every concrete (and abstract) kernel object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Abstract root of the object hierarchy.
    AutoObject,
    /// Abstract waitable object.
    SynchronizationObject,
    /// Readable half of an event pair.
    ReadableEvent,
    /// Emulated guest thread.
    Thread,
    /// Server endpoint of a port.
    ServerPort,
    /// Server endpoint of a session.
    ServerSession,
    /// Client endpoint of a port.
    ClientPort,
    /// Client endpoint of a session.
    ClientSession,
    /// Emulated guest process.
    Process,
    /// Per-process quota tracker.
    ResourceLimit,
    /// Paired client/server port rendezvous object.
    Port,
    /// Paired client/server session channel.
    Session,
    /// Sharable memory block.
    SharedMemory,
    /// Event pair owner.
    Event,
    /// Writable half of an event pair.
    WritableEvent,
    /// One-shot memory transfer object.
    TransferMemory,
}

/// A 16-bit class token; see the module docs for the encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassToken(pub u16);

impl ClassToken {
    /// True when `self` carries every bit of `ancestor`, i.e. the tagged
    /// type is `ancestor` or derives from it.
    pub const fn derives_from(self, ancestor: ClassToken) -> bool {
        (self.0 & ancestor.0) == ancestor.0
    }
}

impl ObjectKind {
    /// Token lookup table. The values reproduce the original tag patterns:
    /// base-class bits in the low byte, one distinct high-byte bit pattern
    /// per final class.
    pub const fn token(self) -> ClassToken {
        let raw: u16 = match self {
            ObjectKind::AutoObject => 0b00000000_00000000,
            ObjectKind::SynchronizationObject => 0b00000000_00000001,
            ObjectKind::ReadableEvent => 0b00000000_00000011,
            ObjectKind::Thread => 0b00010011_00000001,
            ObjectKind::ServerPort => 0b00100011_00000001,
            ObjectKind::ServerSession => 0b01000011_00000001,
            ObjectKind::ClientPort => 0b10000011_00000001,
            ObjectKind::ClientSession => 0b00001101_00000000,
            ObjectKind::Process => 0b00010101_00000001,
            ObjectKind::ResourceLimit => 0b00100101_00000000,
            ObjectKind::Port => 0b10000101_00000000,
            ObjectKind::Session => 0b00011001_00000000,
            ObjectKind::SharedMemory => 0b00101001_00000000,
            ObjectKind::Event => 0b01001001_00000000,
            ObjectKind::WritableEvent => 0b10001001_00000000,
            ObjectKind::TransferMemory => 0b10010001_00000000,
        };
        ClassToken(raw)
    }

    /// Whether objects of this kind are waitable synchronization objects.
    pub const fn is_waitable(self) -> bool {
        self.token().derives_from(ObjectKind::SynchronizationObject.token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The hierarchy checks mirror the generated-token sanity checks of the
    // original object model.

    #[test]
    fn base_tokens_nest() {
        let auto = ObjectKind::AutoObject.token();
        let sync = ObjectKind::SynchronizationObject.token();
        let readable = ObjectKind::ReadableEvent.token();

        assert_eq!(auto.0, 0);
        assert_eq!(sync.0, 0b00000001 | auto.0);
        assert_eq!(readable.0, 0b00000010 | sync.0);
    }

    #[test]
    fn final_tokens_extend_their_base() {
        let auto = ObjectKind::AutoObject.token();
        let sync = ObjectKind::SynchronizationObject.token();

        for kind in [
            ObjectKind::Thread,
            ObjectKind::ServerPort,
            ObjectKind::ServerSession,
            ObjectKind::ClientPort,
            ObjectKind::Process,
        ] {
            assert!(kind.token().derives_from(sync), "{kind:?} must be waitable");
            assert!(kind.is_waitable());
        }

        for kind in [
            ObjectKind::ClientSession,
            ObjectKind::ResourceLimit,
            ObjectKind::Port,
            ObjectKind::Session,
            ObjectKind::SharedMemory,
            ObjectKind::Event,
            ObjectKind::WritableEvent,
            ObjectKind::TransferMemory,
        ] {
            assert!(kind.token().derives_from(auto));
            assert!(!kind.is_waitable(), "{kind:?} must not be waitable");
        }
    }

    #[test]
    fn unrelated_final_tokens_do_not_derive_from_each_other() {
        let a = ObjectKind::ServerSession.token();
        let b = ObjectKind::ServerPort.token();
        assert!(!a.derives_from(b));
        assert!(!b.derives_from(a));

        // A waitable final class never satisfies a non-waitable final tag.
        assert!(!ObjectKind::Thread
            .token()
            .derives_from(ObjectKind::Session.token()));
    }

    #[test]
    fn high_bytes_are_distinct_per_final_class() {
        let finals = [
            ObjectKind::ReadableEvent,
            ObjectKind::Thread,
            ObjectKind::ServerPort,
            ObjectKind::ServerSession,
            ObjectKind::ClientPort,
            ObjectKind::ClientSession,
            ObjectKind::Process,
            ObjectKind::ResourceLimit,
            ObjectKind::Port,
            ObjectKind::Session,
            ObjectKind::SharedMemory,
            ObjectKind::Event,
            ObjectKind::WritableEvent,
            ObjectKind::TransferMemory,
        ];
        for (i, a) in finals.iter().enumerate() {
            for b in finals.iter().skip(i + 1) {
                assert_ne!(a.token(), b.token(), "{a:?} vs {b:?}");
            }
        }
    }
}
