//! Client-side helpers for driving the service layer from tests: a
//! guest-perspective command buffer builder, a response reader, and a
//! small environment bundling kernel, memory, process and thread.

#![allow(dead_code)]

use std::sync::Arc;

use hle_kernel::{
    ArrayMemory, GuestMemory, KProcess, KThread, KernelCore, ObjRef, KResult,
    ResultCode,
};
use hle_service::ipc::{
    BufferDescriptorAbw, BufferDescriptorX, CommandHeader, CommandType,
    HandleDescriptorHeader, COMMAND_BUFFER_LENGTH, SFCI_MAGIC, SFCO_MAGIC,
};

pub const GUEST_MEMORY_SIZE: usize = 0x10_0000;

pub struct TestEnv {
    pub kernel: Arc<KernelCore>,
    pub memory: Arc<ArrayMemory>,
    pub process: ObjRef<KProcess>,
    pub thread: ObjRef<KThread>,
}

impl TestEnv {
    pub fn new() -> TestEnv {
        let kernel = Arc::new(KernelCore::new());
        let memory = Arc::new(ArrayMemory::new(0, GUEST_MEMORY_SIZE));
        let process = KProcess::new(&kernel, "test-client");
        let thread =
            KThread::new(&kernel, &process, "main", 0x1000).expect("thread quota available");
        TestEnv {
            kernel,
            memory,
            process,
            thread,
        }
    }

    /// Spawn an extra guest thread with its own TLS block.
    pub fn spawn_thread(&self, name: &str, tls_address: u64) -> ObjRef<KThread> {
        KThread::new(&self.kernel, &self.process, name, tls_address)
            .expect("thread quota available")
    }

    pub fn write_command_buffer(&self, tls_address: u64, words: &[u32; COMMAND_BUFFER_LENGTH]) {
        write_words(self.memory.as_ref(), tls_address, words);
    }

    pub fn read_command_buffer(&self, tls_address: u64) -> [u32; COMMAND_BUFFER_LENGTH] {
        read_words(self.memory.as_ref(), tls_address)
    }
}

pub fn write_words(memory: &dyn GuestMemory, address: u64, words: &[u32; COMMAND_BUFFER_LENGTH]) {
    let mut bytes = [0u8; COMMAND_BUFFER_LENGTH * 4];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words.iter()) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    memory.write_block(address, &bytes).expect("tls in range");
}

pub fn read_words(memory: &dyn GuestMemory, address: u64) -> [u32; COMMAND_BUFFER_LENGTH] {
    let mut bytes = [0u8; COMMAND_BUFFER_LENGTH * 4];
    memory.read_block(address, &mut bytes).expect("tls in range");
    let mut words = [0u32; COMMAND_BUFFER_LENGTH];
    for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
        *word = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    words
}

/// Builds request command buffers the way a guest client would.
pub struct ClientRequest {
    command_type: CommandType,
    command_id: u64,
    send_pid: bool,
    copy_handles: Vec<u32>,
    move_handles: Vec<u32>,
    buffers_x: Vec<BufferDescriptorX>,
    buffers_a: Vec<BufferDescriptorAbw>,
    buffers_b: Vec<BufferDescriptorAbw>,
    domain: Option<(u32, u32)>,
    args: Vec<u32>,
}

impl ClientRequest {
    pub fn request(command_id: u64) -> ClientRequest {
        ClientRequest::with_type(CommandType::Request, command_id)
    }

    pub fn control(command_id: u64) -> ClientRequest {
        ClientRequest::with_type(CommandType::Control, command_id)
    }

    fn with_type(command_type: CommandType, command_id: u64) -> ClientRequest {
        ClientRequest {
            command_type,
            command_id,
            send_pid: false,
            copy_handles: Vec::new(),
            move_handles: Vec::new(),
            buffers_x: Vec::new(),
            buffers_a: Vec::new(),
            buffers_b: Vec::new(),
            domain: None,
            args: Vec::new(),
        }
    }

    /// Wrap the request in a domain message targeting `object_id`.
    pub fn domain(mut self, command: u32, object_id: u32) -> Self {
        self.domain = Some((command, object_id));
        self
    }

    pub fn close() -> [u32; COMMAND_BUFFER_LENGTH] {
        let mut buf = [0u32; COMMAND_BUFFER_LENGTH];
        let mut header = CommandHeader::default();
        header.set_command_type(CommandType::Close);
        buf[0] = header.low;
        buf[1] = header.high;
        buf
    }

    pub fn send_pid(mut self) -> Self {
        self.send_pid = true;
        self
    }

    pub fn copy_handle(mut self, handle: u32) -> Self {
        self.copy_handles.push(handle);
        self
    }

    pub fn move_handle(mut self, handle: u32) -> Self {
        self.move_handles.push(handle);
        self
    }

    pub fn in_buffer(mut self, address: u64, size: u64) -> Self {
        self.buffers_a.push(BufferDescriptorAbw::pack(address, size, 0));
        self
    }

    pub fn in_pointer(mut self, address: u64, size: u16, counter: u32) -> Self {
        self.buffers_x
            .push(BufferDescriptorX::pack(address, size, counter));
        self
    }

    pub fn out_buffer(mut self, address: u64, size: u64) -> Self {
        self.buffers_b.push(BufferDescriptorAbw::pack(address, size, 0));
        self
    }

    pub fn arg_u32(mut self, value: u32) -> Self {
        self.args.push(value);
        self
    }

    pub fn arg_u64(mut self, value: u64) -> Self {
        self.args.push(value as u32);
        self.args.push((value >> 32) as u32);
        self
    }

    pub fn arg_raw(mut self, bytes: &[u8]) -> Self {
        for chunk in bytes.chunks(4) {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            self.args.push(u32::from_le_bytes(word));
        }
        self
    }

    pub fn build(self) -> [u32; COMMAND_BUFFER_LENGTH] {
        let mut buf = [0u32; COMMAND_BUFFER_LENGTH];
        let mut index = 2usize;

        let has_handles = self.send_pid || !self.copy_handles.is_empty()
            || !self.move_handles.is_empty();
        if has_handles {
            let mut handle_header = HandleDescriptorHeader::default();
            handle_header.set_send_current_pid(self.send_pid);
            handle_header.set_num_handles_to_copy(self.copy_handles.len());
            handle_header.set_num_handles_to_move(self.move_handles.len());
            buf[index] = handle_header.0;
            index += 1;
            if self.send_pid {
                // PID placeholder, filled in by the kernel on hardware.
                index += 2;
            }
            for handle in &self.copy_handles {
                buf[index] = *handle;
                index += 1;
            }
            for handle in &self.move_handles {
                buf[index] = *handle;
                index += 1;
            }
        }

        for x in &self.buffers_x {
            buf[index] = x.word0;
            buf[index + 1] = x.word1;
            index += 2;
        }
        for a in &self.buffers_a {
            buf[index] = a.size_low;
            buf[index + 1] = a.address_low;
            buf[index + 2] = a.packed;
            index += 3;
        }
        for b in &self.buffers_b {
            buf[index] = b.size_low;
            buf[index + 1] = b.address_low;
            buf[index + 2] = b.packed;
            index += 3;
        }

        let raw_start_unaligned = index;
        if index & 3 != 0 {
            index += 4 - (index & 3);
        }
        if let Some((command, object_id)) = self.domain {
            let payload_bytes = ((4 + self.args.len()) * 4) as u32;
            buf[index] = command | (payload_bytes << 16);
            buf[index + 1] = object_id;
            index += 4;
        }
        buf[index] = SFCI_MAGIC;
        buf[index + 2] = self.command_id as u32;
        buf[index + 3] = (self.command_id >> 32) as u32;
        index += 4;
        for arg in &self.args {
            buf[index] = *arg;
            index += 1;
        }

        let mut header = CommandHeader::default();
        header.set_command_type(self.command_type);
        header.set_num_x_descriptors(self.buffers_x.len());
        header.set_num_a_descriptors(self.buffers_a.len());
        header.set_num_b_descriptors(self.buffers_b.len());
        header.set_data_size((index - raw_start_unaligned) as u32);
        header.set_enable_handle_descriptor(has_handles);
        buf[0] = header.low;
        buf[1] = header.high;
        buf
    }
}

/// Reads a reply command buffer the way a guest client would.
pub struct ClientResponse {
    buf: [u32; COMMAND_BUFFER_LENGTH],
    index: usize,
    copy_handles: Vec<u32>,
    move_handles: Vec<u32>,
    domain_object_count: usize,
}

impl ClientResponse {
    pub fn parse(buf: [u32; COMMAND_BUFFER_LENGTH]) -> ClientResponse {
        Self::parse_inner(buf, false)
    }

    /// Parse a reply on a converted domain session, which carries a
    /// domain response header before the payload.
    pub fn parse_domain(buf: [u32; COMMAND_BUFFER_LENGTH]) -> ClientResponse {
        Self::parse_inner(buf, true)
    }

    fn parse_inner(buf: [u32; COMMAND_BUFFER_LENGTH], domain: bool) -> ClientResponse {
        let header = CommandHeader {
            low: buf[0],
            high: buf[1],
        };
        let mut index = 2usize;
        let mut copy_handles = Vec::new();
        let mut move_handles = Vec::new();
        if header.enable_handle_descriptor() {
            let handle_header = HandleDescriptorHeader(buf[index]);
            index += 1;
            if handle_header.send_current_pid() {
                index += 2;
            }
            for _ in 0..handle_header.num_handles_to_copy() {
                copy_handles.push(buf[index]);
                index += 1;
            }
            for _ in 0..handle_header.num_handles_to_move() {
                move_handles.push(buf[index]);
                index += 1;
            }
        }
        if index & 3 != 0 {
            index += 4 - (index & 3);
        }
        let mut domain_object_count = 0;
        if domain {
            domain_object_count = buf[index] as usize;
            index += 4;
        }
        assert_eq!(buf[index], SFCO_MAGIC, "reply payload without SFCO magic");
        index += 2;
        ClientResponse {
            buf,
            index,
            copy_handles,
            move_handles,
            domain_object_count,
        }
    }

    pub fn pop_result(&mut self) -> ResultCode {
        let code = ResultCode(self.pop_u32());
        self.pop_u32();
        code
    }

    pub fn pop_u32(&mut self) -> u32 {
        let value = self.buf[self.index];
        self.index += 1;
        value
    }

    pub fn pop_u64(&mut self) -> u64 {
        u64::from(self.pop_u32()) | (u64::from(self.pop_u32()) << 32)
    }

    pub fn copy_handles(&self) -> &[u32] {
        &self.copy_handles
    }

    pub fn move_handles(&self) -> &[u32] {
        &self.move_handles
    }

    /// Number of domain object ids appended after the parameters.
    pub fn domain_object_count(&self) -> usize {
        self.domain_object_count
    }
}

/// Write `request` to the thread's TLS block, issue a synchronous
/// request, and read the reply back. Blocks until the server replies.
pub fn sync_request(
    env_memory: &Arc<ArrayMemory>,
    kernel: &Arc<KernelCore>,
    session: &hle_kernel::ObjRef<hle_kernel::KClientSession>,
    thread: &ObjRef<KThread>,
    request: [u32; COMMAND_BUFFER_LENGTH],
) -> KResult<[u32; COMMAND_BUFFER_LENGTH]> {
    write_words(env_memory.as_ref(), thread.tls_address(), &request);
    session.send_sync_request(kernel, thread)?;
    Ok(read_words(env_memory.as_ref(), thread.tls_address()))
}
