use std::rc::Rc;

use bytes::BytesMut;

use crate::base::instruction::Instruction;
use crate::base::message::{Field, Message};
use crate::base::types::{Template, templates_from_xml};
use crate::base::value::{Value, ValueType};
use crate::common::dictionary::{Dictionary, PreviousValue};
use crate::common::repo::TemplateRepo;
use crate::encoder::buffer::{Buffer, FixedBuffer};
use crate::encoder::pmap::EncoderPresenceMap;
use crate::encoder::stream::OutputStream;
use crate::utils::stacked::Stacked;
use crate::{DynamicError, Error, Result};

/// Encoder for FAST protocol messages.
///
/// Owns the template repository and the dictionary of previous values carried
/// across messages, and is therefore not shareable between threads.
#[derive(Debug)]
pub struct Encoder {
    pub(crate) repo: TemplateRepo,
    pub(crate) dictionary: Dictionary,
    pub(crate) active_template_id: Option<u32>,
    allow_overlong_pmap: bool,
}

impl Encoder {
    pub(crate) fn new_from_templates(ts: Vec<Template>) -> Result<Self> {
        let repo = TemplateRepo::build(ts)?;
        let dictionary = repo.new_dictionary();
        let active_template_id = repo.unique_entry().map(|t| t.id);
        Ok(Encoder {
            repo,
            dictionary,
            active_template_id,
            allow_overlong_pmap: false,
        })
    }

    pub fn new_from_xml(text: &str) -> Result<Self> {
        Self::new_from_templates(templates_from_xml(text)?)
    }

    /// Register additional templates. When exactly one template is registered in total,
    /// the active template id is preset to it so the id can be elided on the wire.
    pub fn include_xml(&mut self, text: &str) -> Result<()> {
        self.repo.add(templates_from_xml(text)?)?;
        self.dictionary.resize(self.repo.slot_count());
        self.active_template_id = self.repo.unique_entry().map(|t| t.id);
        Ok(())
    }

    /// Clear every previous value back to undefined.
    pub fn reset(&mut self) {
        self.dictionary.reset();
    }

    /// Keep trailing zero bytes of emitted presence maps instead of trimming them.
    pub fn allow_overlong_pmap(&mut self, allow: bool) {
        self.allow_overlong_pmap = allow;
    }

    pub fn template_with_id(&self, id: u32) -> Option<&Template> {
        self.repo.get_template(id)
    }

    /// Encode one message into a fresh vector.
    pub fn encode_vec(&mut self, msg: &Message, force_reset: bool) -> Result<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_to(msg, &mut buf, force_reset)?;
        Ok(buf.to_vec())
    }

    /// Encode one message into a fresh `BytesMut`.
    pub fn encode_bytes(&mut self, msg: &Message, force_reset: bool) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode_to(msg, &mut buf, force_reset)?;
        Ok(buf)
    }

    /// Encode one message into a fixed buffer, returning the number of bytes written.
    /// Fails with [`Error::CapacityExceeded`] when the buffer is too small; the buffer
    /// contents are unspecified on failure.
    pub fn encode_buffer(
        &mut self,
        msg: &Message,
        buffer: &mut [u8],
        force_reset: bool,
    ) -> Result<usize> {
        let mut buf = FixedBuffer::new(buffer);
        self.encode_to(msg, &mut buf, force_reset)?;
        Ok(buf.length())
    }

    /// Encode one message, appending to any sink implementing [`Buffer`].
    ///
    /// On failure the sink holds a partial segment and the dictionary may have been
    /// partially advanced; callers needing transactional behavior must discard the
    /// buffer and restore the encoder from a snapshot.
    pub fn encode_to(
        &mut self,
        msg: &Message,
        buf: &mut dyn Buffer,
        force_reset: bool,
    ) -> Result<()> {
        EncoderContext::new(self, buf).encode_segment(msg, force_reset)
    }
}

/// Processing context for encoding one top-level message. Created per `encode` call
/// and destroyed afterwards; only the dictionary and the active template id survive
/// in the [`Encoder`].
pub(crate) struct EncoderContext<'a> {
    repo: &'a TemplateRepo,
    dictionary: &'a mut Dictionary,
    active_template_id: &'a mut Option<u32>,
    pub(crate) strm: OutputStream<'a>,

    // The presence map of the current segment; outer segments' maps stack below.
    pmaps: Stacked<EncoderPresenceMap>,

    // The template id of the current segment, for error context.
    template_id: Stacked<u32>,

    // Names of the aggregates being visited, for error context.
    path: Vec<Rc<str>>,
}

impl<'a> EncoderContext<'a> {
    pub(crate) fn new(e: &'a mut Encoder, buf: &'a mut dyn Buffer) -> Self {
        Self {
            repo: &e.repo,
            dictionary: &mut e.dictionary,
            active_template_id: &mut e.active_template_id,
            strm: OutputStream::new(buf, e.allow_overlong_pmap),
            pmaps: Stacked::new_empty(),
            template_id: Stacked::new_empty(),
            path: Vec::new(),
        }
    }

    /// Encode one segment: the presence map reservation, the template id when it differs
    /// from the active one, and the message fields, then commit the presence map.
    pub(crate) fn encode_segment(&mut self, msg: &Message, force_reset: bool) -> Result<()> {
        let template = self
            .repo
            .find(msg.id())
            .ok_or(Error::Dynamic(DynamicError::UnknownTemplate {
                template_id: msg.id(),
            }))? // [ERR D9]
            .clone();

        self.setup_pmap(template.segment_pmap_size)?;
        self.template_id.push(template.id);

        if force_reset || template.reset {
            self.dictionary.reset();
        }

        let need_template_id = *self.active_template_id != Some(template.id);
        self.pmap_set_next_bit(need_template_id);
        if need_template_id {
            *self.active_template_id = Some(template.id);
            self.strm.write_uint(u64::from(template.id))?;
        }

        self.encode_fields(&template.instructions, &msg.fields)?;

        self.template_id.pop();
        self.commit_pmap()
    }

    fn encode_fields(&mut self, instructions: &[Instruction], fields: &[Field]) -> Result<()> {
        if instructions.len() != fields.len() {
            return Err(Error::Runtime(format!(
                "segment '{}' has {} fields, the message carries {}",
                self.path_string(),
                instructions.len(),
                fields.len()
            )));
        }
        for (instruction, field) in instructions.iter().zip(fields) {
            self.path.push(instruction.name.clone());
            let res = self.encode_field(instruction, field);
            self.path.pop();
            res?;
        }
        Ok(())
    }

    fn encode_field(&mut self, instruction: &Instruction, field: &Field) -> Result<()> {
        match instruction.value_type {
            ValueType::Group => self.encode_group(instruction, field),
            ValueType::Sequence => self.encode_sequence(instruction, field),
            ValueType::TemplateReference => self.encode_template_reference(instruction, field),
            _ => match field {
                Field::Scalar(value) => instruction.inject(self, value),
                _ => Err(self.kind_mismatch(instruction, field)),
            },
        }
    }

    // If a group field is optional, it occupies a single bit in the enclosing presence
    // map. The contents of the group appear in the stream iff the bit is set.
    fn encode_group(&mut self, instruction: &Instruction, field: &Field) -> Result<()> {
        let Field::Group(group) = field else {
            return Err(self.kind_mismatch(instruction, field));
        };
        let Some(fields) = group else {
            return if instruction.is_optional() {
                self.pmap_set_next_bit(false);
                Ok(())
            } else {
                Err(Error::Runtime(format!(
                    "missing mandatory group: {}",
                    self.path_string()
                )))
            };
        };
        if instruction.is_optional() {
            self.pmap_set_next_bit(true);
        }

        if instruction.segment_pmap_size > 0 {
            self.setup_pmap(instruction.segment_pmap_size)?;
            self.encode_fields(&instruction.instructions, fields)?;
            self.commit_pmap()
        } else {
            self.encode_fields(&instruction.instructions, fields)
        }
    }

    // A sequence encodes its length through the length instruction's operator, then each
    // element in order, opening a fresh presence map per element when the element fields
    // need one.
    fn encode_sequence(&mut self, instruction: &Instruction, field: &Field) -> Result<()> {
        let Field::Sequence(sequence) = field else {
            return Err(self.kind_mismatch(instruction, field));
        };
        let length_instruction = instruction
            .instructions
            .first()
            .ok_or_else(|| Error::Runtime("sequence has no length field".to_string()))?;

        let Some(items) = sequence else {
            return if instruction.is_optional() {
                length_instruction.inject(self, &None)
            } else {
                Err(Error::Runtime(format!(
                    "missing mandatory sequence: {}",
                    self.path_string()
                )))
            };
        };

        length_instruction.inject(self, &Some(Value::UInt32(items.len() as u32)))?;
        for item in items {
            if instruction.segment_pmap_size > 0 {
                self.setup_pmap(instruction.segment_pmap_size)?;
                self.encode_fields(&instruction.instructions[1..], item)?;
                self.commit_pmap()?;
            } else {
                self.encode_fields(&instruction.instructions[1..], item)?;
            }
        }
        Ok(())
    }

    // A dynamic template reference embeds a whole segment. The active template id and the
    // current presence map are restored afterwards, so the embedded message always spells
    // out its template id and the outer segment continues unaffected.
    fn encode_template_reference(&mut self, instruction: &Instruction, field: &Field) -> Result<()> {
        let Field::Nested(target) = field else {
            return Err(self.kind_mismatch(instruction, field));
        };
        let saved_template_id = *self.active_template_id;
        self.encode_segment(target, false)?;
        *self.active_template_id = saved_template_id;
        Ok(())
    }

    pub(crate) fn setup_pmap(&mut self, max_bits: usize) -> Result<()> {
        let pmap = EncoderPresenceMap::init(&mut self.strm, max_bits)?;
        self.pmaps.push(pmap);
        Ok(())
    }

    pub(crate) fn commit_pmap(&mut self) -> Result<()> {
        let pmap = self
            .pmaps
            .pop()
            .ok_or_else(|| Error::Runtime("commit of an unopened presence map".to_string()))?;
        pmap.commit(&mut self.strm)
    }

    #[inline]
    pub(crate) fn pmap_set_next_bit(&mut self, value: bool) {
        self.pmaps.must_peek_mut().set_next_bit(value);
    }

    #[inline]
    pub(crate) fn prev(&self, instruction: &Instruction) -> &PreviousValue {
        self.dictionary.get(instruction.slot)
    }

    #[inline]
    pub(crate) fn set_prev(&mut self, instruction: &Instruction, value: PreviousValue) {
        self.dictionary.set(instruction.slot, value);
    }

    pub(crate) fn empty_previous_error(&self) -> Error {
        Error::Dynamic(DynamicError::EmptyPreviousValue {
            template_id: self.template_id.peek().copied().unwrap_or(0),
            path: self.path_string(),
        })
    }

    fn kind_mismatch(&self, instruction: &Instruction, field: &Field) -> Error {
        Error::Runtime(format!(
            "field {} is declared as {}, the message carries a {field}",
            self.path_string(),
            instruction.value_type.type_str()
        ))
    }

    fn path_string(&self) -> String {
        let parts: Vec<&str> = self
            .path
            .iter()
            .map(|p| p.as_ref())
            .filter(|p| !p.is_empty())
            .collect();
        parts.join(".")
    }
}
