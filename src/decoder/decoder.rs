use std::io::Read;
use std::rc::Rc;

use crate::base::instruction::Instruction;
use crate::base::message::{Field, Message};
use crate::base::types::{Template, templates_from_xml};
use crate::base::value::{Value, ValueType};
use crate::common::dictionary::{Dictionary, PreviousValue};
use crate::common::repo::TemplateRepo;
use crate::decoder::pmap::PresenceMap;
use crate::decoder::reader::{Reader, StreamReader};
use crate::utils::stacked::Stacked;
use crate::{DynamicError, Error, Result};

/// Decoder for FAST protocol messages, the mirror of [`crate::Encoder`].
///
/// Owns its template repository and dictionary; feeding it the byte stream an encoder
/// produced leaves both sides with identical previous values.
pub struct Decoder {
    pub(crate) repo: TemplateRepo,
    pub(crate) dictionary: Dictionary,
    pub(crate) active_template_id: Option<u32>,
}

impl Decoder {
    pub(crate) fn new_from_templates(ts: Vec<Template>) -> Result<Self> {
        let repo = TemplateRepo::build(ts)?;
        let dictionary = repo.new_dictionary();
        let active_template_id = repo.unique_entry().map(|t| t.id);
        Ok(Decoder {
            repo,
            dictionary,
            active_template_id,
        })
    }

    pub fn new_from_xml(text: &str) -> Result<Self> {
        Self::new_from_templates(templates_from_xml(text)?)
    }

    /// Register additional templates, mirroring [`crate::Encoder::include_xml`].
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

    pub fn template_with_id(&self, id: u32) -> Option<&Template> {
        self.repo.get_template(id)
    }

    /// Decode a single message from a byte vector. The vector must hold exactly one
    /// message; trailing bytes are an error.
    pub fn decode_vec(&mut self, bytes: Vec<u8>) -> Result<Message> {
        let mut raw = bytes::Bytes::from(bytes);
        let msg = self.decode_reader(&mut raw)?;
        if !raw.is_empty() {
            return Err(Error::Runtime(format!(
                "bytes left in the buffer after decoding: {}",
                raw.len()
            )));
        }
        Ok(msg)
    }

    /// Decode a single message from `bytes::Bytes`, consuming only the bytes of that message.
    pub fn decode_bytes(&mut self, bytes: &mut bytes::Bytes) -> Result<Message> {
        self.decode_reader(bytes)
    }

    /// Decode a single message from any [`Reader`].
    pub fn decode_reader(&mut self, rdr: &mut impl Reader) -> Result<Message> {
        DecoderContext::new(self, rdr).decode_segment()
    }

    /// Decode a single message from a [`std::io::Read`] stream. A stream that ends
    /// cleanly before the first byte reports [`Error::Eof`].
    pub fn decode_stream(&mut self, rdr: &mut dyn Read) -> Result<Message> {
        let mut rdr = StreamReader::new(rdr);
        self.decode_reader(&mut rdr)
    }
}

/// Processing context for decoding one top-level message.
pub(crate) struct DecoderContext<'a> {
    repo: &'a TemplateRepo,
    dictionary: &'a mut Dictionary,
    active_template_id: &'a mut Option<u32>,
    pub(crate) rdr: &'a mut dyn Reader,

    // The presence map of the current segment; outer segments' maps stack below.
    pmaps: Stacked<PresenceMap>,

    // The template id of the current segment, for error context.
    template_id: Stacked<u32>,

    // Names of the aggregates being visited, for error context.
    path: Vec<Rc<str>>,
}

impl<'a> DecoderContext<'a> {
    pub(crate) fn new(d: &'a mut Decoder, rdr: &'a mut impl Reader) -> Self {
        Self {
            repo: &d.repo,
            dictionary: &mut d.dictionary,
            active_template_id: &mut d.active_template_id,
            rdr,
            pmaps: Stacked::new_empty(),
            template_id: Stacked::new_empty(),
            path: Vec::new(),
        }
    }

    /// Decode one segment: its presence map, the template id when the first pmap bit is
    /// set, and the fields of the resolved template.
    pub(crate) fn decode_segment(&mut self) -> Result<Message> {
        let (bitmap, size) = self.rdr.read_presence_map()?;
        self.pmaps.push(PresenceMap::new(bitmap, size));

        let id = if self.pmap_next_bit_set() {
            let id = self.read_template_id()?;
            *self.active_template_id = Some(id);
            id
        } else {
            (*self.active_template_id).ok_or_else(|| {
                Error::Runtime("stream carries no template id and none is active".to_string())
            })?
        };
        let template = self
            .repo
            .find(id)
            .ok_or(Error::Dynamic(DynamicError::UnknownTemplate {
                template_id: id,
            }))? // [ERR D9]
            .clone();

        if template.reset {
            self.dictionary.reset();
        }

        self.template_id.push(template.id);
        let fields = self.decode_fields(&template.instructions)?;
        self.template_id.pop();

        self.pmaps.pop();
        Ok(Message { id, fields })
    }

    fn read_template_id(&mut self) -> Result<u32> {
        let id = self.rdr.read_uint()?;
        u32::try_from(id).map_err(|_| {
            Error::Dynamic(DynamicError::OutOfRange {
                detail: format!("template id: {id}"),
            })
        })
    }

    fn decode_fields(&mut self, instructions: &[Instruction]) -> Result<Vec<Field>> {
        let mut fields = Vec::with_capacity(instructions.len());
        for instruction in instructions {
            self.path.push(instruction.name.clone());
            let res = self.decode_field(instruction);
            self.path.pop();
            fields.push(res?);
        }
        Ok(fields)
    }

    fn decode_field(&mut self, instruction: &Instruction) -> Result<Field> {
        match instruction.value_type {
            ValueType::Group => self.decode_group(instruction),
            ValueType::Sequence => self.decode_sequence(instruction),
            ValueType::TemplateReference => self.decode_template_reference(),
            _ => Ok(Field::Scalar(instruction.extract(self)?)),
        }
    }

    fn decode_group(&mut self, instruction: &Instruction) -> Result<Field> {
        if instruction.is_optional() && !self.pmap_next_bit_set() {
            return Ok(Field::Group(None));
        }
        let fields = if instruction.segment_pmap_size > 0 {
            let (bitmap, size) = self.rdr.read_presence_map()?;
            self.pmaps.push(PresenceMap::new(bitmap, size));
            let fields = self.decode_fields(&instruction.instructions)?;
            self.pmaps.pop();
            fields
        } else {
            self.decode_fields(&instruction.instructions)?
        };
        Ok(Field::Group(Some(fields)))
    }

    fn decode_sequence(&mut self, instruction: &Instruction) -> Result<Field> {
        let length_instruction = instruction
            .instructions
            .first()
            .ok_or_else(|| Error::Runtime("sequence has no length field".to_string()))?;
        let length = match length_instruction.extract(self)? {
            None => return Ok(Field::Sequence(None)),
            Some(Value::UInt32(n)) => n,
            Some(v) => {
                return Err(Error::Runtime(format!(
                    "sequence length must be UInt32, got: {v:?} instead"
                )));
            }
        };
        let mut items = Vec::with_capacity(length as usize);
        for _ in 0..length {
            if instruction.segment_pmap_size > 0 {
                let (bitmap, size) = self.rdr.read_presence_map()?;
                self.pmaps.push(PresenceMap::new(bitmap, size));
                let item = self.decode_fields(&instruction.instructions[1..]);
                self.pmaps.pop();
                items.push(item?);
            } else {
                items.push(self.decode_fields(&instruction.instructions[1..])?);
            }
        }
        Ok(Field::Sequence(Some(items)))
    }

    // A dynamic template reference embeds a whole segment; the active template id is
    // restored afterwards, mirroring the encoder.
    fn decode_template_reference(&mut self) -> Result<Field> {
        let saved_template_id = *self.active_template_id;
        let msg = self.decode_segment()?;
        *self.active_template_id = saved_template_id;
        Ok(Field::Nested(Box::new(msg)))
    }

    #[inline]
    pub(crate) fn pmap_next_bit_set(&mut self) -> bool {
        self.pmaps.must_peek_mut().next_bit_set()
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
