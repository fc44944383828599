//! Typed readers and writers for the raw data section of a command
//! buffer.
//!
//! `RequestParser` walks the request payload after the command id;
//! `ResponseBuilder` lays out the whole response buffer (header, handle
//! descriptor, domain header, `SFCO` payload) and then takes pushed
//! values. Values smaller than a word still consume a full word, and
//! results occupy a 64-bit slot with a zero high word, as on the wire.

use hle_kernel::{AutoObject, KClientSession, ObjRef, ResultCode};

use crate::hle_ipc::{HLERequestContext, SessionHandlerRef};
use crate::ipc::{CommandHeader, HandleDescriptorHeader, COMMAND_BUFFER_LENGTH, SFCO_MAGIC};

/// Reads values from a request's raw data section.
pub struct RequestParser<'a> {
    buf: &'a [u32; COMMAND_BUFFER_LENGTH],
    index: usize,
}

impl<'a> RequestParser<'a> {
    /// Position past the payload header and u64 command id, on the first
    /// parameter word.
    pub fn new(ctx: &'a HLERequestContext) -> RequestParser<'a> {
        RequestParser {
            buf: &ctx.cmd_buf,
            index: ctx.data_payload_offset + 4,
        }
    }

    pub fn current_offset(&self) -> usize {
        self.index
    }

    pub fn skip(&mut self, words: usize) {
        self.index += words;
    }

    pub fn pop_u32(&mut self) -> u32 {
        let value = self.buf[self.index];
        self.index += 1;
        value
    }

    pub fn pop_u64(&mut self) -> u64 {
        let low = u64::from(self.pop_u32());
        let high = u64::from(self.pop_u32());
        (high << 32) | low
    }

    /// A sub-word value still occupies a full word.
    pub fn pop_u8(&mut self) -> u8 {
        self.pop_u32() as u8
    }

    pub fn pop_u16(&mut self) -> u16 {
        self.pop_u32() as u16
    }

    pub fn pop_bool(&mut self) -> bool {
        self.pop_u8() != 0
    }

    pub fn pop_result(&mut self) -> ResultCode {
        ResultCode(self.pop_u32())
    }

    /// Copy the next `N` bytes out of the payload, consuming whole words.
    pub fn pop_raw<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            let word = self.buf[self.index + i / 4];
            *byte = (word >> ((i % 4) * 8)) as u8;
        }
        self.index += N.div_ceil(4);
        out
    }
}

/// Builds a response buffer in place on the context.
///
/// Construction writes every fixed part of the buffer; parameters are
/// then pushed in order and `finish` asserts the declared sizes were
/// honored. Dropping a builder without calling [`ResponseBuilder::finish`]
/// loses those checks, so dispatch code always finishes.
pub struct ResponseBuilder<'a> {
    ctx: &'a mut HLERequestContext,
    index: usize,
    normal_params_size: usize,
    num_handles_to_copy: usize,
    num_objects_to_move: usize,
    datapayload_index: usize,
}

impl<'a> ResponseBuilder<'a> {
    /// A response with `normal_params_size` parameter words (the 64-bit
    /// result slot included) and no objects.
    pub fn new(ctx: &'a mut HLERequestContext, normal_params_size: usize) -> ResponseBuilder<'a> {
        Self::with_objects(ctx, normal_params_size, 0, 0)
    }

    /// A response carrying objects: `num_objects_to_move` become move
    /// handles, or domain object ids when the session is a domain.
    pub fn with_objects(
        ctx: &'a mut HLERequestContext,
        normal_params_size: usize,
        num_handles_to_copy: usize,
        num_objects_to_move: usize,
    ) -> ResponseBuilder<'a> {
        let is_domain = ctx.is_domain();
        let request_had_domain_header = ctx.domain_message_header().is_some();

        ctx.cmd_buf = [0; COMMAND_BUFFER_LENGTH];
        ctx.clear_incoming_objects();

        let (num_handles_to_move, num_domain_objects) = if is_domain {
            (0, num_objects_to_move)
        } else {
            (num_objects_to_move, 0)
        };

        // Payload header + mandatory 16 bytes of padding + params, plus
        // the domain header and object ids on domain sessions.
        let mut raw_data_size = 2 + 4 + normal_params_size;
        if is_domain {
            raw_data_size += crate::ipc::DOMAIN_MESSAGE_HEADER_WORDS + num_domain_objects;
        }

        let mut header = CommandHeader::default();
        header.set_data_size(raw_data_size as u32);
        let has_handles = num_handles_to_copy + num_handles_to_move > 0;
        header.set_enable_handle_descriptor(has_handles);
        ctx.cmd_buf[0] = header.low;
        ctx.cmd_buf[1] = header.high;
        let mut index = 2;

        if has_handles {
            let mut handle_header = HandleDescriptorHeader::default();
            handle_header.set_num_handles_to_copy(num_handles_to_copy);
            handle_header.set_num_handles_to_move(num_handles_to_move);
            ctx.cmd_buf[index] = handle_header.0;
            index += 1;
            ctx.handles_offset = index;
            index += num_handles_to_copy + num_handles_to_move;
        }

        if index & 3 != 0 {
            index += 4 - (index & 3);
        }

        if is_domain && request_had_domain_header {
            // Response domain header carries only the outgoing object
            // count.
            ctx.cmd_buf[index] = num_domain_objects as u32;
            index += crate::ipc::DOMAIN_MESSAGE_HEADER_WORDS;
        }

        ctx.cmd_buf[index] = SFCO_MAGIC;
        index += 2;
        let datapayload_index = index;
        ctx.data_payload_offset = datapayload_index;

        ResponseBuilder {
            ctx,
            index,
            normal_params_size,
            num_handles_to_copy,
            num_objects_to_move,
            datapayload_index,
        }
    }

    pub fn push_u32(&mut self, value: u32) {
        self.ctx.cmd_buf[self.index] = value;
        self.index += 1;
    }

    pub fn push_u64(&mut self, value: u64) {
        self.push_u32(value as u32);
        self.push_u32((value >> 32) as u32);
    }

    pub fn push_u8(&mut self, value: u8) {
        self.push_u32(u32::from(value));
    }

    pub fn push_u16(&mut self, value: u16) {
        self.push_u32(u32::from(value));
    }

    pub fn push_bool(&mut self, value: bool) {
        self.push_u8(u8::from(value));
    }

    /// Results take a 64-bit slot; the high word is always zero.
    pub fn push_result(&mut self, result: ResultCode) {
        self.push_u32(result.0);
        self.push_u32(0);
    }

    pub fn push_move_object(&mut self, object: ObjRef<dyn AutoObject>) {
        self.ctx.add_move_object(object);
    }

    pub fn push_copy_object(&mut self, object: ObjRef<dyn AutoObject>) {
        self.ctx.add_copy_object(object);
    }

    pub fn push_move_session(&mut self, session: ObjRef<KClientSession>) {
        self.ctx.add_move_session(session);
    }

    pub fn push_domain_object(&mut self, handler: SessionHandlerRef) {
        self.ctx.add_domain_object(handler);
    }

    /// Validate the declared layout against what was actually pushed and
    /// record where domain object ids will be minted.
    pub fn finish(self) {
        assert_eq!(
            self.index - self.datapayload_index,
            self.normal_params_size,
            "declared parameter size does not match pushed words"
        );
        assert_eq!(
            self.ctx.outgoing_copy_objects.len(),
            self.num_handles_to_copy,
            "declared copy-handle count does not match pushed objects"
        );
        let moved = self.ctx.outgoing_move_objects.len() + self.ctx.outgoing_domain_objects.len();
        assert_eq!(
            moved, self.num_objects_to_move,
            "declared move-object count does not match pushed objects"
        );
        self.ctx.domain_offset = self.index;
    }
}
