//! In-flight request state: parsing an incoming command buffer out of
//! guest memory, tracking translated objects, and writing the response
//! back.
//!
//! Handle protocol: incoming handles are recorded raw while parsing and
//! only resolved against the requesting process's handle table when a
//! handler asks for them, so a garbage handle surfaces as an error to
//! that handler instead of poisoning the parse. Outgoing objects are
//! collected on the context and minted as fresh handles in the
//! requester's table when the response buffer is written back.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use hle_kernel::{
    AutoObject, GuestMemory, KClientSession, KProcess, KServerSession, KThread, KernelCore,
    KernelError, ObjRef, KResult, TypedObject,
};

use crate::ipc::{
    BufferDescriptorAbw, BufferDescriptorC, BufferDescriptorX, CommandHeader, CommandType,
    DomainCommand, DomainMessageHeader, HandleDescriptorHeader, COMMAND_BUFFER_LENGTH,
    DOMAIN_MESSAGE_HEADER_WORDS, SFCI_MAGIC,
};

/// What the dispatcher should do with a request after its handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleResult {
    /// Write the response back and reply to the client.
    Reply,
    /// Park the request; it will be retried when the deferral event fires.
    Defer,
}

/// A service-side request handler bound to one session (or one domain
/// object within it).
pub trait SessionRequestHandler: Send + Sync {
    fn service_name(&self) -> &str;

    /// Handle one sync request. The response buffer is built through the
    /// context; returning `Defer` leaves the request buffer untouched so
    /// the call can be retried later.
    fn handle_sync_request(&self, ctx: &mut HLERequestContext) -> KResult<HandleResult>;

    /// The client half of the session went away.
    fn client_disconnected(&self, _session: &ObjRef<KServerSession>) {}
}

pub type SessionHandlerRef = Arc<dyn SessionRequestHandler>;

/// Per-session request state shared between the dispatcher and cloned
/// sessions: the bound handler and, once converted, the domain object
/// table.
pub struct SessionRequestManager {
    session_handler: Mutex<Option<SessionHandlerRef>>,
    domain: Mutex<Option<Vec<Option<SessionHandlerRef>>>>,
}

impl SessionRequestManager {
    pub fn new(handler: SessionHandlerRef) -> Arc<Self> {
        Arc::new(SessionRequestManager {
            session_handler: Mutex::new(Some(handler)),
            domain: Mutex::new(None),
        })
    }

    pub fn is_domain(&self) -> bool {
        self.domain.lock().is_some()
    }

    pub fn session_handler(&self) -> Option<SessionHandlerRef> {
        self.session_handler.lock().clone()
    }

    /// Convert to a domain. The session handler becomes domain object 1.
    pub fn convert_to_domain(&self) -> u32 {
        let handler = self.session_handler.lock().clone();
        let mut domain = self.domain.lock();
        debug_assert!(domain.is_none(), "double domain conversion");
        *domain = Some(vec![handler]);
        1
    }

    /// Look up a domain object by its 1-based wire id.
    pub fn domain_handler(&self, object_id: u32) -> KResult<SessionHandlerRef> {
        let domain = self.domain.lock();
        let handlers = domain.as_ref().ok_or(KernelError::InvalidState)?;
        handlers
            .get(object_id.wrapping_sub(1) as usize)
            .cloned()
            .flatten()
            .ok_or(KernelError::NotFound)
    }

    /// Append a new domain object, returning its 1-based wire id.
    pub fn append_domain_handler(&self, handler: SessionHandlerRef) -> u32 {
        let mut domain = self.domain.lock();
        let handlers = domain.as_mut().expect("appending to a non-domain session");
        handlers.push(Some(handler));
        handlers.len() as u32
    }

    /// Drop a domain object slot. The id stays burned.
    pub fn close_domain_handler(&self, object_id: u32) -> KResult<()> {
        let mut domain = self.domain.lock();
        let handlers = domain.as_mut().ok_or(KernelError::InvalidState)?;
        let slot = handlers
            .get_mut(object_id.wrapping_sub(1) as usize)
            .ok_or(KernelError::NotFound)?;
        if slot.take().is_none() {
            return Err(KernelError::NotFound);
        }
        Ok(())
    }

    pub fn domain_handler_count(&self) -> usize {
        self.domain
            .lock()
            .as_ref()
            .map(|handlers| handlers.iter().flatten().count())
            .unwrap_or(0)
    }
}

/// One in-flight HLE request: the parsed command buffer plus everything
/// needed to write the reply.
pub struct HLERequestContext {
    kernel: Arc<KernelCore>,
    memory: Arc<dyn GuestMemory>,
    session: ObjRef<KServerSession>,
    manager: Arc<SessionRequestManager>,
    thread: ObjRef<KThread>,

    pub(crate) cmd_buf: [u32; COMMAND_BUFFER_LENGTH],
    command_header: CommandHeader,
    handle_descriptor_header: Option<HandleDescriptorHeader>,
    domain_message_header: Option<DomainMessageHeader>,

    buffer_x: Vec<BufferDescriptorX>,
    buffer_a: Vec<BufferDescriptorAbw>,
    buffer_b: Vec<BufferDescriptorAbw>,
    buffer_w: Vec<BufferDescriptorAbw>,
    buffer_c: Vec<BufferDescriptorC>,

    incoming_copy_handles: Vec<u32>,
    incoming_move_handles: Vec<u32>,
    pub(crate) outgoing_copy_objects: Vec<ObjRef<dyn AutoObject>>,
    pub(crate) outgoing_move_objects: Vec<ObjRef<dyn AutoObject>>,
    pub(crate) outgoing_domain_objects: Vec<SessionHandlerRef>,

    pid: Option<u64>,
    command: u64,
    pub(crate) data_payload_offset: usize,
    pub(crate) handles_offset: usize,
    pub(crate) domain_offset: usize,
}

impl HLERequestContext {
    /// Read the requesting thread's command buffer out of guest memory and
    /// parse it.
    pub fn new(
        kernel: Arc<KernelCore>,
        memory: Arc<dyn GuestMemory>,
        session: ObjRef<KServerSession>,
        manager: Arc<SessionRequestManager>,
        thread: ObjRef<KThread>,
    ) -> KResult<HLERequestContext> {
        let mut bytes = [0u8; COMMAND_BUFFER_LENGTH * 4];
        memory.read_block(thread.tls_address(), &mut bytes)?;
        let mut cmd_buf = [0u32; COMMAND_BUFFER_LENGTH];
        for (word, chunk) in cmd_buf.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes(chunk.try_into().expect("chunk is 4 bytes"));
        }

        let mut ctx = HLERequestContext {
            kernel,
            memory,
            session,
            manager,
            thread,
            cmd_buf,
            command_header: CommandHeader::default(),
            handle_descriptor_header: None,
            domain_message_header: None,
            buffer_x: Vec::new(),
            buffer_a: Vec::new(),
            buffer_b: Vec::new(),
            buffer_w: Vec::new(),
            buffer_c: Vec::new(),
            incoming_copy_handles: Vec::new(),
            incoming_move_handles: Vec::new(),
            outgoing_copy_objects: Vec::new(),
            outgoing_move_objects: Vec::new(),
            outgoing_domain_objects: Vec::new(),
            pid: None,
            command: 0,
            data_payload_offset: 0,
            handles_offset: 0,
            domain_offset: 0,
        };
        ctx.parse_incoming()?;
        Ok(ctx)
    }

    fn parse_incoming(&mut self) -> KResult<()> {
        self.command_header = CommandHeader {
            low: self.cmd_buf[0],
            high: self.cmd_buf[1],
        };
        let mut index = 2usize;

        if self.command_header.command_type() == CommandType::Close {
            return Ok(());
        }

        if self.command_header.enable_handle_descriptor() {
            let header = HandleDescriptorHeader(self.cmd_buf[index]);
            index += 1;
            if header.send_current_pid() {
                self.pid = Some(
                    u64::from(self.cmd_buf[index]) | (u64::from(self.cmd_buf[index + 1]) << 32),
                );
                index += 2;
            }
            for _ in 0..header.num_handles_to_copy() {
                self.incoming_copy_handles.push(self.cmd_buf[index]);
                index += 1;
            }
            for _ in 0..header.num_handles_to_move() {
                self.incoming_move_handles.push(self.cmd_buf[index]);
                index += 1;
            }
            self.handle_descriptor_header = Some(header);
        }

        for _ in 0..self.command_header.num_x_descriptors() {
            self.buffer_x.push(BufferDescriptorX {
                word0: self.cmd_buf[index],
                word1: self.cmd_buf[index + 1],
            });
            index += 2;
        }
        for _ in 0..self.command_header.num_a_descriptors() {
            self.buffer_a.push(read_abw(&self.cmd_buf, &mut index));
        }
        for _ in 0..self.command_header.num_b_descriptors() {
            self.buffer_b.push(read_abw(&self.cmd_buf, &mut index));
        }
        for _ in 0..self.command_header.num_w_descriptors() {
            self.buffer_w.push(read_abw(&self.cmd_buf, &mut index));
        }

        // C descriptors sit after the raw data section, whose size already
        // counts the alignment padding inserted below.
        let c_offset = index + self.command_header.data_size() as usize;
        for i in 0..self.command_header.num_c_descriptors() {
            self.buffer_c.push(BufferDescriptorC {
                address_low: self.cmd_buf[c_offset + i * 2],
                packed: self.cmd_buf[c_offset + i * 2 + 1],
            });
        }

        // Raw data section is 16-byte aligned.
        if index & 3 != 0 {
            index += 4 - (index & 3);
        }

        if self.manager.is_domain() && self.command_header.command_type().is_request() {
            let header = DomainMessageHeader {
                word0: self.cmd_buf[index],
                object_id: self.cmd_buf[index + 1],
            };
            index += DOMAIN_MESSAGE_HEADER_WORDS;
            self.domain_message_header = Some(header);
            if header.command() == DomainCommand::CloseVirtualHandle {
                self.data_payload_offset = index;
                return Ok(());
            }
        }

        self.data_payload_offset = index;
        let command_type = self.command_header.command_type();
        if command_type.is_request() || command_type.is_control() {
            let magic = self.cmd_buf[index];
            if magic != SFCI_MAGIC {
                warn!(magic, "request payload without SFCI magic");
                return Err(KernelError::InvalidState);
            }
            self.command = u64::from(self.cmd_buf[index + 2])
                | (u64::from(self.cmd_buf[index + 3]) << 32);
        }
        Ok(())
    }

    /// Mint handles and domain ids for outgoing objects, then write the
    /// buffer back to the requesting thread's TLS block.
    pub fn write_outgoing(&mut self) -> KResult<()> {
        let thread = self.thread.clone();
        let handle_table = thread.owner().handle_table();
        let mut slot = self.handles_offset;
        for object in self
            .outgoing_copy_objects
            .drain(..)
            .chain(self.outgoing_move_objects.drain(..))
        {
            self.cmd_buf[slot] = handle_table.add(object)?;
            slot += 1;
        }

        let manager = Arc::clone(&self.manager);
        if manager.is_domain() {
            let mut slot = self.domain_offset;
            for handler in self.outgoing_domain_objects.drain(..) {
                self.cmd_buf[slot] = manager.append_domain_handler(handler);
                slot += 1;
            }
        }

        let mut bytes = [0u8; COMMAND_BUFFER_LENGTH * 4];
        for (chunk, word) in bytes.chunks_exact_mut(4).zip(self.cmd_buf.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        self.memory.write_block(self.thread.tls_address(), &bytes)
    }

    pub fn kernel(&self) -> &Arc<KernelCore> {
        &self.kernel
    }

    pub fn memory(&self) -> &Arc<dyn GuestMemory> {
        &self.memory
    }

    pub fn session(&self) -> &ObjRef<KServerSession> {
        &self.session
    }

    pub fn manager(&self) -> &Arc<SessionRequestManager> {
        &self.manager
    }

    pub fn thread(&self) -> &ObjRef<KThread> {
        &self.thread
    }

    /// The requesting process.
    pub fn process(&self) -> &ObjRef<KProcess> {
        self.thread.owner()
    }

    pub fn command_type(&self) -> CommandType {
        self.command_header.command_type()
    }

    /// The u64 command id from the request payload.
    pub fn command(&self) -> u64 {
        self.command
    }

    pub fn is_domain(&self) -> bool {
        self.manager.is_domain()
    }

    pub fn domain_message_header(&self) -> Option<DomainMessageHeader> {
        self.domain_message_header
    }

    pub fn pid(&self) -> Option<u64> {
        self.pid
    }

    pub fn data_payload_offset(&self) -> usize {
        self.data_payload_offset
    }

    pub fn buffer_x_descriptors(&self) -> &[BufferDescriptorX] {
        &self.buffer_x
    }

    pub fn buffer_a_descriptors(&self) -> &[BufferDescriptorAbw] {
        &self.buffer_a
    }

    pub fn buffer_b_descriptors(&self) -> &[BufferDescriptorAbw] {
        &self.buffer_b
    }

    pub fn buffer_c_descriptors(&self) -> &[BufferDescriptorC] {
        &self.buffer_c
    }

    /// Read the input buffer at `index`, choosing between the A and X
    /// descriptor families the way the original protocol does.
    pub fn read_buffer(&self, index: usize) -> KResult<Vec<u8>> {
        let (address, size) = if self
            .buffer_a
            .get(index)
            .map(|d| d.size() > 0)
            .unwrap_or(false)
        {
            let d = &self.buffer_a[index];
            (d.address(), d.size())
        } else {
            let d = self.buffer_x.get(index).ok_or(KernelError::InvalidAddress)?;
            (d.address(), d.size())
        };
        let mut data = vec![0u8; size as usize];
        self.memory.read_block(address, &mut data)?;
        Ok(data)
    }

    /// Write `data` to the output buffer at `index` (B family, falling
    /// back to the C receive list). Returns the number of bytes written.
    pub fn write_buffer(&self, index: usize, data: &[u8]) -> KResult<usize> {
        let (address, size) = if self
            .buffer_b
            .get(index)
            .map(|d| d.size() > 0)
            .unwrap_or(false)
        {
            let d = &self.buffer_b[index];
            (d.address(), d.size())
        } else {
            let d = self.buffer_c.get(index).ok_or(KernelError::InvalidAddress)?;
            (d.address(), d.size())
        };
        let len = data.len().min(size as usize);
        self.memory.write_block(address, &data[..len])?;
        Ok(len)
    }

    /// Incoming copy-handle object at `index`, downcast to `T`.
    pub fn get_copy_object<T: TypedObject>(&self, index: usize) -> KResult<ObjRef<T>> {
        let handle = *self
            .incoming_copy_handles
            .get(index)
            .ok_or(KernelError::InvalidHandle)?;
        self.thread.owner().handle_table().get_typed::<T>(handle)
    }

    /// Incoming move-handle object at `index`, downcast to `T`. Ownership
    /// transfers: the handle leaves the sender's table on resolution.
    pub fn get_move_object<T: TypedObject>(&self, index: usize) -> KResult<ObjRef<T>> {
        let handle = *self
            .incoming_move_handles
            .get(index)
            .ok_or(KernelError::InvalidHandle)?;
        let handle_table = self.thread.owner().handle_table();
        let object = handle_table.get_typed::<T>(handle)?;
        handle_table.remove(handle);
        Ok(object)
    }

    pub fn add_move_object(&mut self, object: ObjRef<dyn AutoObject>) {
        self.outgoing_move_objects.push(object);
    }

    pub fn add_copy_object(&mut self, object: ObjRef<dyn AutoObject>) {
        self.outgoing_copy_objects.push(object);
    }

    pub fn add_domain_object(&mut self, handler: SessionHandlerRef) {
        self.outgoing_domain_objects.push(handler);
    }

    /// Convenience for the commonest response object.
    pub fn add_move_session(&mut self, session: ObjRef<KClientSession>) {
        self.outgoing_move_objects.push(session.upcast());
    }

    /// Forget the recorded incoming handles. Called when the response
    /// buffer is started; unresolved handles stay in the sender's table.
    pub(crate) fn clear_incoming_objects(&mut self) {
        self.incoming_copy_handles.clear();
        self.incoming_move_handles.clear();
    }
}

fn read_abw(cmd_buf: &[u32; COMMAND_BUFFER_LENGTH], index: &mut usize) -> BufferDescriptorAbw {
    let desc = BufferDescriptorAbw {
        size_low: cmd_buf[*index],
        address_low: cmd_buf[*index + 1],
        packed: cmd_buf[*index + 2],
    };
    *index += 3;
    desc
}
