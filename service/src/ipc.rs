//! The HIPC command buffer layout, bit for bit.
//!
//! A command buffer is 0x100 bytes (64 words) at the requesting thread's
//! TLS. Layout: command header, optional handle descriptor, X then A/B/W
//! buffer descriptors, then the raw data section aligned to 16 bytes with
//! an `SFCI`/`SFCO` payload header, and trailing C descriptors. Domain
//! sessions insert a domain message header in front of the payload.

/// Size of the command buffer area, in 32-bit words.
pub const COMMAND_BUFFER_LENGTH: usize = 0x100 / 4;

/// `SFCI`: request payload magic.
pub const SFCI_MAGIC: u32 = u32::from_le_bytes(*b"SFCI");
/// `SFCO`: response payload magic.
pub const SFCO_MAGIC: u32 = u32::from_le_bytes(*b"SFCO");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Invalid,
    Close,
    Request,
    Control,
    RequestWithContext,
    ControlWithContext,
}

impl CommandType {
    pub fn from_raw(raw: u32) -> CommandType {
        match raw {
            2 => CommandType::Close,
            4 => CommandType::Request,
            5 => CommandType::Control,
            6 => CommandType::RequestWithContext,
            7 => CommandType::ControlWithContext,
            _ => CommandType::Invalid,
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            CommandType::Invalid => 0,
            CommandType::Close => 2,
            CommandType::Request => 4,
            CommandType::Control => 5,
            CommandType::RequestWithContext => 6,
            CommandType::ControlWithContext => 7,
        }
    }

    /// A sync request, with or without the token word.
    pub fn is_request(self) -> bool {
        matches!(self, CommandType::Request | CommandType::RequestWithContext)
    }

    /// A session control command, with or without the token word.
    pub fn is_control(self) -> bool {
        matches!(self, CommandType::Control | CommandType::ControlWithContext)
    }
}

/// Session control commands, dispatched when the header type is `Control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    ConvertSessionToDomain,
    QueryPointerBufferSize,
    Unknown(u32),
}

impl ControlCommand {
    pub fn from_raw(raw: u32) -> ControlCommand {
        match raw {
            0 => ControlCommand::ConvertSessionToDomain,
            3 => ControlCommand::QueryPointerBufferSize,
            other => ControlCommand::Unknown(other),
        }
    }
}

/// Commands carried in a domain message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainCommand {
    SendMessage,
    CloseVirtualHandle,
    Unknown(u32),
}

impl DomainCommand {
    pub fn from_raw(raw: u32) -> DomainCommand {
        match raw {
            1 => DomainCommand::SendMessage,
            2 => DomainCommand::CloseVirtualHandle,
            other => DomainCommand::Unknown(other),
        }
    }
}

/// The two leading words of every command buffer.
///
/// Word 0: type in bits 0..16, then 4-bit X/A/B/W descriptor counts.
/// Word 1: raw-data size in words (bits 0..10), C-descriptor flags
/// (bits 10..14), handle-descriptor enable (bit 31).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandHeader {
    pub low: u32,
    pub high: u32,
}

impl CommandHeader {
    pub fn command_type(&self) -> CommandType {
        CommandType::from_raw(self.low & 0xffff)
    }

    pub fn num_x_descriptors(&self) -> usize {
        ((self.low >> 16) & 0xf) as usize
    }

    pub fn num_a_descriptors(&self) -> usize {
        ((self.low >> 20) & 0xf) as usize
    }

    pub fn num_b_descriptors(&self) -> usize {
        ((self.low >> 24) & 0xf) as usize
    }

    pub fn num_w_descriptors(&self) -> usize {
        ((self.low >> 28) & 0xf) as usize
    }

    /// Size of the raw data section, in words, padding included.
    pub fn data_size(&self) -> u32 {
        self.high & 0x3ff
    }

    /// C-descriptor flags: 0 disabled, 1 inlined, otherwise flags - 2
    /// descriptors follow the raw section.
    pub fn c_descriptor_flags(&self) -> u32 {
        (self.high >> 10) & 0xf
    }

    pub fn num_c_descriptors(&self) -> usize {
        match self.c_descriptor_flags() {
            0 | 1 => 0,
            2 => 1,
            flags => (flags - 2) as usize,
        }
    }

    pub fn enable_handle_descriptor(&self) -> bool {
        self.high & (1 << 31) != 0
    }

    pub fn set_command_type(&mut self, ty: CommandType) {
        self.low = (self.low & !0xffff) | ty.to_raw();
    }

    pub fn set_num_x_descriptors(&mut self, n: usize) {
        debug_assert!(n < 16);
        self.low = (self.low & !(0xf << 16)) | ((n as u32) << 16);
    }

    pub fn set_num_a_descriptors(&mut self, n: usize) {
        debug_assert!(n < 16);
        self.low = (self.low & !(0xf << 20)) | ((n as u32) << 20);
    }

    pub fn set_num_b_descriptors(&mut self, n: usize) {
        debug_assert!(n < 16);
        self.low = (self.low & !(0xf << 24)) | ((n as u32) << 24);
    }

    pub fn set_num_w_descriptors(&mut self, n: usize) {
        debug_assert!(n < 16);
        self.low = (self.low & !(0xf << 28)) | ((n as u32) << 28);
    }

    pub fn set_data_size(&mut self, words: u32) {
        debug_assert!(words < 1 << 10);
        self.high = (self.high & !0x3ff) | words;
    }

    pub fn set_c_descriptor_flags(&mut self, flags: u32) {
        debug_assert!(flags < 16);
        self.high = (self.high & !(0xf << 10)) | (flags << 10);
    }

    pub fn set_enable_handle_descriptor(&mut self, enable: bool) {
        if enable {
            self.high |= 1 << 31;
        } else {
            self.high &= !(1 << 31);
        }
    }
}

/// One word after the command header when handles are attached: send-PID
/// flag in bit 0, copy-handle count in bits 1..5, move-handle count in
/// bits 5..9.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleDescriptorHeader(pub u32);

impl HandleDescriptorHeader {
    pub fn send_current_pid(&self) -> bool {
        self.0 & 1 != 0
    }

    pub fn num_handles_to_copy(&self) -> usize {
        ((self.0 >> 1) & 0xf) as usize
    }

    pub fn num_handles_to_move(&self) -> usize {
        ((self.0 >> 5) & 0xf) as usize
    }

    pub fn set_send_current_pid(&mut self, send: bool) {
        if send {
            self.0 |= 1;
        } else {
            self.0 &= !1;
        }
    }

    pub fn set_num_handles_to_copy(&mut self, n: usize) {
        debug_assert!(n < 16);
        self.0 = (self.0 & !(0xf << 1)) | ((n as u32) << 1);
    }

    pub fn set_num_handles_to_move(&mut self, n: usize) {
        debug_assert!(n < 16);
        self.0 = (self.0 & !(0xf << 5)) | ((n as u32) << 5);
    }
}

/// Pointer (X) descriptor: two words carrying a 16-bit size, a split
/// 9-bit counter and a split 39-bit address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDescriptorX {
    pub word0: u32,
    pub word1: u32,
}

impl BufferDescriptorX {
    pub fn counter(&self) -> u32 {
        (self.word0 & 0x3f) | (((self.word0 >> 9) & 0x7) << 9)
    }

    pub fn address(&self) -> u64 {
        u64::from(self.word1)
            | (u64::from((self.word0 >> 12) & 0xf) << 32)
            | (u64::from((self.word0 >> 6) & 0x7) << 36)
    }

    pub fn size(&self) -> u64 {
        u64::from(self.word0 >> 16)
    }

    pub fn pack(address: u64, size: u16, counter: u32) -> BufferDescriptorX {
        debug_assert!(address < 1 << 39);
        debug_assert!(counter < 1 << 12);
        let word0 = (counter & 0x3f)
            | (((counter >> 9) & 0x7) << 9)
            | ((((address >> 36) & 0x7) as u32) << 6)
            | ((((address >> 32) & 0xf) as u32) << 12)
            | (u32::from(size) << 16);
        BufferDescriptorX {
            word0,
            word1: address as u32,
        }
    }
}

/// Send/receive/exchange (A/B/W) descriptor: three words with split
/// 36-bit size and 39-bit address plus 2 flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDescriptorAbw {
    pub size_low: u32,
    pub address_low: u32,
    pub packed: u32,
}

impl BufferDescriptorAbw {
    pub fn address(&self) -> u64 {
        u64::from(self.address_low)
            | (u64::from((self.packed >> 28) & 0xf) << 32)
            | (u64::from((self.packed >> 2) & 0x7) << 36)
    }

    pub fn size(&self) -> u64 {
        u64::from(self.size_low) | (u64::from((self.packed >> 24) & 0xf) << 32)
    }

    pub fn flags(&self) -> u32 {
        self.packed & 0x3
    }

    pub fn pack(address: u64, size: u64, flags: u32) -> BufferDescriptorAbw {
        debug_assert!(address < 1 << 39);
        debug_assert!(size < 1 << 36);
        debug_assert!(flags < 4);
        let packed = flags
            | ((((address >> 36) & 0x7) as u32) << 2)
            | ((((size >> 32) & 0xf) as u32) << 24)
            | ((((address >> 32) & 0xf) as u32) << 28);
        BufferDescriptorAbw {
            size_low: size as u32,
            address_low: address as u32,
            packed,
        }
    }
}

/// Receive-list (C) descriptor: two words with a 48-bit address and a
/// 16-bit size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferDescriptorC {
    pub address_low: u32,
    pub packed: u32,
}

impl BufferDescriptorC {
    pub fn address(&self) -> u64 {
        u64::from(self.address_low) | (u64::from(self.packed & 0xffff) << 32)
    }

    pub fn size(&self) -> u64 {
        u64::from(self.packed >> 16)
    }

    pub fn pack(address: u64, size: u16) -> BufferDescriptorC {
        debug_assert!(address < 1 << 48);
        BufferDescriptorC {
            address_low: address as u32,
            packed: ((address >> 32) as u32 & 0xffff) | (u32::from(size) << 16),
        }
    }
}

/// Leads the payload inside a domain session request: domain command in
/// bits 0..8, input object count in bits 8..16, payload length in words
/// in bits 16..32, then the target object id and two words of padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainMessageHeader {
    pub word0: u32,
    pub object_id: u32,
}

/// Size of the domain message header in words, padding included.
pub const DOMAIN_MESSAGE_HEADER_WORDS: usize = 4;

impl DomainMessageHeader {
    pub fn command(&self) -> DomainCommand {
        DomainCommand::from_raw(self.word0 & 0xff)
    }

    pub fn input_object_count(&self) -> usize {
        ((self.word0 >> 8) & 0xff) as usize
    }

    pub fn data_size(&self) -> u32 {
        self.word0 >> 16
    }

    pub fn pack(command: u32, input_objects: usize, data_words: u32, object_id: u32) -> Self {
        debug_assert!(command < 0x100);
        debug_assert!(input_objects < 0x100);
        debug_assert!(data_words < 1 << 16);
        DomainMessageHeader {
            word0: command | ((input_objects as u32) << 8) | (data_words << 16),
            object_id,
        }
    }
}
