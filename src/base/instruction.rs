use std::ops::RangeInclusive;
use std::rc::Rc;

use roxmltree::Node;

use crate::base::decimal::Decimal;
use crate::base::types::{Operator, Presence};
use crate::base::value::{Value, ValueType};
use crate::common::dictionary::PreviousValue;
use crate::decoder::decoder::DecoderContext;
use crate::encoder::encoder::EncoderContext;
use crate::{DynamicError, Error, Result};

const MAX_EXPONENT: i32 = 63;
const MIN_EXPONENT: i32 = -63;

const INT32_RANGE: RangeInclusive<i64> = (i32::MIN as i64)..=(i32::MAX as i64);

/// # Field Instruction
///
/// Each field instruction has a name and a type. The name identifies the corresponding field in
/// the current application type. The type specifies the basic encoding of the field. The optional
/// presence attribute indicates whether the field is mandatory or optional. If the attribute is
/// not specified, the field is mandatory.
///
/// A primitive field, i.e. a field that is not a group or sequence, can have a field operator.
/// The operator specifies an optimization operation for the field.
#[derive(Debug, Clone)]
pub(crate) struct Instruction {
    pub(crate) id: u32,

    // The name identifies the corresponding field in the current application type.
    pub(crate) name: Rc<str>,

    // Specifies the basic encoding of the field.
    pub(crate) value_type: ValueType,

    // The optional presence attribute indicates whether the field is mandatory or optional.
    // If the attribute is not specified, the field is mandatory.
    pub(crate) presence: Presence,

    // A primitive field, i.e. a field that is not a group or sequence, can have a field operator.
    pub(crate) operator: Operator,

    // Initial value specified by the value attribute on the operator element.
    pub(crate) initial_value: Option<Value>,

    // Group, Sequence and Decimal have a list of child instructions.
    // For a sequence the first child is always the length instruction.
    pub(crate) instructions: Vec<Instruction>,

    // Index of this field's previous-value cell in the dictionary arena.
    // Assigned by the template repository when the template is registered.
    pub(crate) slot: usize,

    // For Group and Sequence: how many presence map bits a segment of this
    // aggregate needs at most. Zero means the segment carries no pmap of its own.
    pub(crate) segment_pmap_size: usize,
}

impl Instruction {
    fn new(id: u32, name: &str, type_: ValueType) -> Self {
        let name = match type_ {
            ValueType::Mantissa | ValueType::Exponent => "",
            _ => name,
        };
        Self {
            id,
            name: Rc::from(name),
            value_type: type_,
            presence: Presence::Mandatory,
            operator: Operator::None,
            initial_value: None,
            instructions: Vec::new(),
            slot: 0,
            segment_pmap_size: 0,
        }
    }

    #[allow(clippy::too_many_lines)]
    pub(crate) fn from_node(node: Node) -> Result<Self> {
        let id = node.attribute("id").unwrap_or("0").parse::<u32>()?;
        let name = node.attribute("name").unwrap_or("");
        let unicode = match node.attribute("charset") {
            Some("unicode") => true,
            Some(charset) => {
                return Err(Error::Static(format!("unknown charset: {charset}")));
            }
            _ => false,
        };
        let type_ = ValueType::new_from_tag(node.tag_name().name(), unicode)?;
        match type_ {
            ValueType::Mantissa
            | ValueType::Exponent
            | ValueType::Sequence
            | ValueType::Group
            | ValueType::TemplateReference => {}
            _ => {
                if id == 0 {
                    return Err(Error::Static(
                        "instruction must have non-zero 'id' attribute".to_string(),
                    ));
                }
            }
        }
        match type_ {
            ValueType::Mantissa
            | ValueType::Exponent
            | ValueType::Length
            | ValueType::TemplateReference => {}
            _ => {
                if name.is_empty() {
                    return Err(Error::Static(
                        "instruction must have 'name' attribute".to_string(),
                    ));
                }
            }
        }

        let mut instruction = Instruction::new(id, name, type_);
        if let Some(p) = node.attribute("presence") {
            instruction.presence = Presence::from_str(p)?;
        }

        match instruction.value_type {
            ValueType::TemplateReference => {}

            ValueType::Group => {
                for n in node.children().filter(Node::is_element) {
                    let i = Instruction::from_node(n)?;
                    instruction.add_instruction(i);
                }
            }

            ValueType::Sequence => {
                for (i, c) in node.children().filter(Node::is_element).enumerate() {
                    let mut instr = Instruction::from_node(c)?;
                    if i == 0 {
                        if let ValueType::Length = instr.value_type {
                            if instr.name.is_empty() {
                                // The name is generated and is unique to the name of the
                                // sequence field, so it never collides with a field name
                                // explicitly specified in a template.
                                instr.name = Rc::from(format!("{}:length", instruction.name));
                            }
                            // An optional sequence means that the length field is optional.
                            instr.presence = instruction.presence;
                        } else {
                            // If no <length> element is specified, the length field has an
                            // implicit name and no field operator.
                            let mut length = Instruction::new(
                                0,
                                &format!("{}:length", instruction.name),
                                ValueType::Length,
                            );
                            length.presence = instruction.presence;
                            instruction.add_instruction(length);
                        }
                    }
                    instruction.add_instruction(instr);
                }
            }

            ValueType::Decimal => {
                // find out what kind of sub-elements we have
                let mut operator: Option<Operator> = None;
                let mut exponent: Option<Instruction> = None;
                let mut mantissa: Option<Instruction> = None;
                let mut initial_value: Option<String> = None;

                for op_node in node.children().filter(Node::is_element) {
                    let op_name = op_node.tag_name().name();
                    match op_name {
                        "exponent" => {
                            exponent = Some(Instruction::from_node(op_node)?);
                        }
                        "mantissa" => {
                            mantissa = Some(Instruction::from_node(op_node)?);
                        }
                        _ => {
                            operator = Some(Operator::new_from_tag(op_name)?);
                            if let Some(v) = op_node.attribute("value") {
                                initial_value = Some(v.to_string());
                            }
                        }
                    }
                }

                let mut op: Operator;
                let mut ex: Instruction;
                let mut mn: Instruction;
                match (operator, exponent, mantissa) {
                    // No elements.
                    (None, None, None) => {
                        op = Operator::None;
                        ex = Instruction::new(0, "exponent", ValueType::Exponent);
                        mn = Instruction::new(0, "mantissa", ValueType::Mantissa);
                    }
                    // Only one element and it is an operator.
                    (Some(o), None, None) => {
                        op = o;
                        ex = Instruction::new(0, "exponent", ValueType::Exponent);
                        mn = Instruction::new(0, "mantissa", ValueType::Mantissa);
                        match o {
                            // These operate on the components, not the composed value.
                            Operator::Delta | Operator::Increment => {
                                op = Operator::None;
                                ex.operator = o;
                                mn.operator = o;
                            }
                            _ => {}
                        }
                        if let Some(v) = initial_value {
                            let d = Decimal::from_string(&v)?; // [ERR S3]
                            ex.initial_value = Some(Value::Int32(d.exponent));
                            mn.initial_value = Some(Value::Int64(d.mantissa));
                            if op != Operator::None {
                                instruction.initial_value = Some(Value::Decimal(d));
                            }
                        }
                    }
                    // Elements are decimal subcomponents.
                    (None, Some(e), Some(m)) => {
                        op = Operator::None;
                        ex = e;
                        mn = m;
                    }
                    _ => {
                        return Err(Error::Static("invalid decimal elements".to_string()));
                    }
                }
                // Set proper presence flags.
                ex.presence = instruction.presence;
                mn.presence = Presence::Mandatory;
                instruction.operator = op;
                // Put subcomponents into the instruction.
                instruction.add_instruction(ex);
                instruction.add_instruction(mn);
            }

            _ => {
                if let Some(operator) = node.children().find(Node::is_element) {
                    instruction.operator = Operator::new_from_tag(operator.tag_name().name())?;
                    if let Some(s) = operator.attribute("value") {
                        instruction.initial_value =
                            Some(instruction.value_type.str_to_value(s)?); // [ERR S3]
                    }
                }
            }
        }
        instruction.check_is_valid()?;
        Ok(instruction)
    }

    pub(crate) fn check_is_valid(&self) -> Result<()> {
        // Not all operators are applicable to all field types. It is a static error [ERR S2]
        // if an operator is specified for a field type for which it is not applicable.
        if self.value_type.is_vector() && self.operator != Operator::None {
            return Err(Error::Static(format!(
                "field operators are not applicable to {} field type",
                self.value_type.type_str()
            ))); // [ERR S2]
        }
        match self.operator {
            Operator::None | Operator::Copy | Operator::Delta => {
                // The copy and delta operators are applicable to all field types.
            }
            Operator::Constant => {
                // The constant operator is applicable to all field types.
                // It is a static error [ERR S4] if the instruction context has no initial value.
                if self.initial_value.is_none() {
                    return Err(Error::Static(
                        "constant operator has no initial value".to_string(),
                    )); // [ERR S4]
                }
            }
            Operator::Default => {
                // The default operator is applicable to all field types. Unless the field has
                // optional presence, it is a static error [ERR S5] if the instruction context
                // has no initial value.
                if !self.is_optional() && self.initial_value.is_none() {
                    return Err(Error::Static(
                        "default operator has no initial value".to_string(),
                    )); // [ERR S5]
                }
            }
            Operator::Increment => {
                // The increment operator is applicable to integer field types.
                if !self.value_type.is_integer() {
                    return Err(Error::Static(format!(
                        "increment operator is not applicable to {} field type",
                        self.value_type.type_str()
                    ))); // [ERR S2]
                }
            }
            Operator::Tail => {
                // The tail operator is applicable to string and byte vector field types.
                match self.value_type {
                    ValueType::ASCIIString | ValueType::UnicodeString | ValueType::Bytes => {}
                    _ => {
                        return Err(Error::Static(format!(
                            "tail operator is not applicable to {} field type",
                            self.value_type.type_str()
                        ))); // [ERR S2]
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn add_instruction(&mut self, instruction: Instruction) {
        self.instructions.push(instruction);
    }

    pub fn is_optional(&self) -> bool {
        self.presence == Presence::Optional
    }

    // Each field has a type that has a nullability property. If a type is nullable, there is
    // a special representation of a NULL value. When a type is non-nullable, no representation
    // for NULL is reserved.
    pub(crate) fn is_nullable(&self) -> bool {
        match self.operator {
            Operator::Constant => false,
            _ => self.is_optional(),
        }
    }

    // How many bits this field occupies in the presence map of its enclosing segment.
    pub(crate) fn pmap_bits(&self) -> usize {
        match self.operator {
            Operator::None | Operator::Delta => 0,
            Operator::Default | Operator::Copy | Operator::Increment | Operator::Tail => 1,
            Operator::Constant => usize::from(self.is_optional()),
        }
    }

    //
    // Encoding
    //

    /// Encode one field occurrence: apply the operator rules against the previous value,
    /// emit the presence map bit when the operator takes one, write whatever must appear
    /// on the wire and advance the previous-value cell.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn inject(&self, s: &mut EncoderContext, value: &Option<Value>) -> Result<()> {
        if value.is_none() && !self.is_optional() {
            return Err(Error::Runtime(format!(
                "mandatory field {} has no value",
                self.name
            )));
        }
        match self.operator {
            Operator::None => {
                // No pmap bit; an optional field uses the nullable representation.
                if !self.value_type.is_vector() {
                    s.set_prev(self, PreviousValue::from_option(value));
                }
                self.write(s, value)
            }

            // The value of a constant field is never transferred. An optional constant field
            // occupies a single bit signalling its presence.
            Operator::Constant => {
                if let Some(v) = value
                    && self.initial_value.as_ref() != Some(v)
                {
                    return Err(Error::Runtime(format!(
                        "constant field {} has inconsistent value: {v}",
                        self.name
                    )));
                }
                if self.is_optional() {
                    s.pmap_set_next_bit(value.is_some());
                }
                s.set_prev(self, PreviousValue::from_option(value));
                Ok(())
            }

            // One bit. A value equal to the initial value is elided; anything else appears
            // on the wire, including NULL for an absent optional value. The NULL case leaves
            // the previous value untouched.
            Operator::Default => {
                if self.initial_value == *value {
                    s.pmap_set_next_bit(false);
                    s.set_prev(self, PreviousValue::from_option(value));
                    Ok(())
                } else {
                    s.pmap_set_next_bit(true);
                    if value.is_some() {
                        s.set_prev(self, PreviousValue::from_option(value));
                    }
                    self.write(s, value)
                }
            }

            // One bit. Only a value equal to the previous one is elided: with an undefined
            // previous value the field is transmitted even when it equals the initial value,
            // so the decision never depends on the initial value.
            Operator::Copy => match s.prev(self).clone() {
                PreviousValue::Assigned(ref p) if value.as_ref() == Some(p) => {
                    s.pmap_set_next_bit(false);
                    Ok(())
                }
                PreviousValue::Empty => {
                    if value.is_none() {
                        s.pmap_set_next_bit(false);
                        Ok(())
                    } else if !self.is_optional() {
                        Err(s.empty_previous_error()) // [ERR D6]
                    } else {
                        s.pmap_set_next_bit(true);
                        s.set_prev(self, PreviousValue::from_option(value));
                        self.write(s, value)
                    }
                }
                _ => {
                    s.pmap_set_next_bit(true);
                    s.set_prev(self, PreviousValue::from_option(value));
                    self.write(s, value)
                }
            },

            // One bit. Like copy, with the match test being previous + 1.
            Operator::Increment => match s.prev(self).clone() {
                PreviousValue::Assigned(ref p)
                    if value.is_some() && p.checked_increment().as_ref() == value.as_ref() =>
                {
                    s.pmap_set_next_bit(false);
                    s.set_prev(self, PreviousValue::from_option(value));
                    Ok(())
                }
                PreviousValue::Empty => {
                    if value.is_none() {
                        s.pmap_set_next_bit(false);
                        Ok(())
                    } else if !self.is_optional() {
                        Err(s.empty_previous_error()) // [ERR D6]
                    } else {
                        s.pmap_set_next_bit(true);
                        s.set_prev(self, PreviousValue::from_option(value));
                        self.write(s, value)
                    }
                }
                _ => {
                    s.pmap_set_next_bit(true);
                    s.set_prev(self, PreviousValue::from_option(value));
                    self.write(s, value)
                }
            },

            // No bit: a delta always appears in the stream. An absent optional value is a
            // NULL delta and leaves the previous value untouched.
            Operator::Delta => {
                let Some(value) = value else {
                    return self.write_delta(s, None);
                };
                let base = match s.prev(self) {
                    PreviousValue::Assigned(p) => p.clone(),
                    PreviousValue::Empty => {
                        return Err(s.empty_previous_error()); // [ERR D6]
                    }
                    PreviousValue::Undefined => match &self.initial_value {
                        Some(v) => v.clone(),
                        None => self.value_type.to_default_value()?,
                    },
                };
                let delta = value.find_delta(&base)?;
                s.set_prev(self, PreviousValue::Assigned(value.clone()));
                self.write_delta(s, Some(delta))
            }

            // One bit. The tail is elided when the value equals the assigned previous value
            // (previous preserved), or, with an undefined previous value, the initial value.
            Operator::Tail => {
                let prev = s.prev(self).clone();
                match prev {
                    PreviousValue::Assigned(ref p) if value.as_ref() == Some(p) => {
                        s.pmap_set_next_bit(false);
                        Ok(())
                    }
                    PreviousValue::Undefined if self.initial_value == *value => {
                        s.pmap_set_next_bit(false);
                        s.set_prev(self, PreviousValue::from_option(value));
                        Ok(())
                    }
                    PreviousValue::Empty if value.is_none() => {
                        s.pmap_set_next_bit(false);
                        Ok(())
                    }
                    _ => {
                        s.pmap_set_next_bit(true);
                        match value {
                            None => {
                                s.set_prev(self, PreviousValue::Empty);
                                self.write_tail(s, None)
                            }
                            Some(v) => {
                                let base = match prev {
                                    PreviousValue::Assigned(p) => p,
                                    _ => match &self.initial_value {
                                        Some(v) => v.clone(),
                                        None => self.value_type.to_default_value()?,
                                    },
                                };
                                let tail = v.find_tail(&base)?;
                                s.set_prev(self, PreviousValue::Assigned(v.clone()));
                                self.write_tail(s, Some(tail))
                            }
                        }
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn write(&self, s: &mut EncoderContext, value: &Option<Value>) -> Result<()> {
        match self.value_type {
            ValueType::UInt32 | ValueType::Length => match value {
                None => self.write_uint(s, None),
                Some(Value::UInt32(v)) => self.write_uint(s, Some(u64::from(*v))),
                _ => Err(self.bad_value_error("UInt32", value)),
            },
            ValueType::Int32 => match value {
                None => self.write_int(s, None),
                Some(Value::Int32(v)) => self.write_int(s, Some(i64::from(*v))),
                _ => Err(self.bad_value_error("Int32", value)),
            },
            ValueType::UInt64 => match value {
                None => self.write_uint(s, None),
                Some(Value::UInt64(v)) => self.write_uint(s, Some(*v)),
                _ => Err(self.bad_value_error("UInt64", value)),
            },
            ValueType::Int64 | ValueType::Mantissa => match value {
                None => self.write_int(s, None),
                Some(Value::Int64(v)) => self.write_int(s, Some(*v)),
                _ => Err(self.bad_value_error("Int64", value)),
            },
            ValueType::Exponent => match value {
                None => self.write_exponent(s, None),
                Some(Value::Int32(v)) => self.write_exponent(s, Some(*v)),
                _ => Err(self.bad_value_error("Int32", value)),
            },
            ValueType::Decimal => match value {
                None => self.write_decimal(s, None),
                Some(Value::Decimal(d)) => self.write_decimal(s, Some(d.clone())),
                _ => Err(self.bad_value_error("Decimal", value)),
            },
            ValueType::ASCIIString => match value {
                None => self.write_ascii_string(s, None),
                Some(Value::ASCIIString(v)) => self.write_ascii_string(s, Some(v)),
                Some(Value::UnicodeString(v)) if v.is_ascii() => {
                    self.write_ascii_string(s, Some(v))
                }
                _ => Err(self.bad_value_error("ASCIIString", value)),
            },
            ValueType::UnicodeString => match value {
                None => self.write_unicode_string(s, None),
                Some(Value::UnicodeString(v) | Value::ASCIIString(v)) => {
                    self.write_unicode_string(s, Some(v))
                }
                _ => Err(self.bad_value_error("UnicodeString", value)),
            },
            ValueType::Bytes => match value {
                None => self.write_bytes(s, None),
                Some(Value::Bytes(v)) => self.write_bytes(s, Some(v)),
                _ => Err(self.bad_value_error("Bytes", value)),
            },
            ValueType::Int32Vector | ValueType::Int64Vector => match value {
                None => s.strm.write_uint_nullable(None),
                Some(Value::IntVector(v)) => {
                    if self.value_type == ValueType::Int32Vector
                        && let Some(x) = v.iter().find(|x| !INT32_RANGE.contains(*x))
                    {
                        return Err(Error::Dynamic(DynamicError::OutOfRange {
                            detail: format!("int32Vector element {x} of field {}", self.name),
                        }));
                    }
                    self.write_vector_length(s, v.len())?;
                    for x in v {
                        s.strm.write_int(*x)?;
                    }
                    Ok(())
                }
                _ => Err(self.bad_value_error("IntVector", value)),
            },
            ValueType::UInt32Vector | ValueType::UInt64Vector => match value {
                None => s.strm.write_uint_nullable(None),
                Some(Value::UIntVector(v)) => {
                    if self.value_type == ValueType::UInt32Vector
                        && let Some(x) = v.iter().find(|x| **x > u64::from(u32::MAX))
                    {
                        return Err(Error::Dynamic(DynamicError::OutOfRange {
                            detail: format!("uInt32Vector element {x} of field {}", self.name),
                        }));
                    }
                    self.write_vector_length(s, v.len())?;
                    for x in v {
                        s.strm.write_uint(*x)?;
                    }
                    Ok(())
                }
                _ => Err(self.bad_value_error("UIntVector", value)),
            },
            _ => Err(Error::Runtime(format!(
                "field {} of type {} cannot be written as a scalar",
                self.name,
                self.value_type.type_str()
            ))),
        }
    }

    fn bad_value_error(&self, expected: &str, value: &Option<Value>) -> Error {
        Error::Runtime(format!(
            "Field {} must have {expected} value, got: {value:?} instead",
            self.name
        ))
    }

    fn write_uint(&self, s: &mut EncoderContext, value: Option<u64>) -> Result<()> {
        if self.is_nullable() {
            s.strm.write_uint_nullable(value)
        } else {
            s.strm.write_uint(value.ok_or_else(|| self.no_value_error())?)
        }
    }

    fn write_int(&self, s: &mut EncoderContext, value: Option<i64>) -> Result<()> {
        if self.is_nullable() {
            s.strm.write_int_nullable(value)
        } else {
            s.strm.write_int(value.ok_or_else(|| self.no_value_error())?)
        }
    }

    fn write_ascii_string(&self, s: &mut EncoderContext, value: Option<&str>) -> Result<()> {
        if self.is_nullable() {
            s.strm.write_ascii_string_nullable(value)
        } else {
            s.strm
                .write_ascii_string(value.ok_or_else(|| self.no_value_error())?)
        }
    }

    fn write_unicode_string(&self, s: &mut EncoderContext, value: Option<&str>) -> Result<()> {
        if self.is_nullable() {
            s.strm.write_unicode_string_nullable(value)
        } else {
            s.strm
                .write_unicode_string(value.ok_or_else(|| self.no_value_error())?)
        }
    }

    fn write_bytes(&self, s: &mut EncoderContext, value: Option<&[u8]>) -> Result<()> {
        if self.is_nullable() {
            s.strm.write_bytes_nullable(value)
        } else {
            s.strm.write_bytes(value.ok_or_else(|| self.no_value_error())?)
        }
    }

    fn write_vector_length(&self, s: &mut EncoderContext, len: usize) -> Result<()> {
        if self.is_nullable() {
            s.strm.write_uint_nullable(Some(len as u64))
        } else {
            s.strm.write_uint(len as u64)
        }
    }

    fn write_exponent(&self, s: &mut EncoderContext, value: Option<i32>) -> Result<()> {
        if let Some(e) = value
            && !(MIN_EXPONENT..=MAX_EXPONENT).contains(&e)
        {
            return Err(Error::Dynamic(DynamicError::ExponentOutOfRange {
                exponent: e,
            })); // [ERR R1]
        }
        self.write_int(s, value.map(i64::from))
    }

    fn write_decimal(&self, s: &mut EncoderContext, value: Option<Decimal>) -> Result<()> {
        let (e, m) = match value {
            None => (None, Value::Int64(0)),
            Some(d) => (Some(Value::Int32(d.exponent)), Value::Int64(d.mantissa)),
        };

        let without_exponent = e.is_none();
        // write exponent
        self.instructions
            .first()
            .ok_or_else(|| Error::Runtime("exponent field not found".to_string()))?
            .inject(s, &e)?;

        if without_exponent {
            return Ok(());
        }
        // write mantissa
        self.instructions
            .get(1)
            .ok_or_else(|| Error::Runtime("mantissa field not found".to_string()))?
            .inject(s, &Some(m))
    }

    // A delta for an integer field is one signed difference. A delta for a string or byte
    // vector field is a signed subtraction length followed by the difference; the length is
    // nullable for an optional field, the difference itself never is.
    fn write_delta(&self, s: &mut EncoderContext, value: Option<(Value, i32)>) -> Result<()> {
        if self.value_type.is_integer() {
            return match value {
                None => self.write_int(s, None),
                Some((Value::Int64(v), _)) => self.write_int(s, Some(v)),
                Some((v, _)) => Err(Error::Runtime(format!(
                    "{} field's delta must be Int64, got: {v:?} instead",
                    self.name
                ))),
            };
        }
        match self.value_type {
            ValueType::ASCIIString | ValueType::UnicodeString | ValueType::Bytes => match value {
                None => self.write_int(s, None),
                Some((delta, sub)) => {
                    self.write_int(s, Some(i64::from(sub)))?;
                    match (&self.value_type, delta) {
                        (ValueType::ASCIIString, Value::ASCIIString(v)) => {
                            s.strm.write_ascii_string(&v)
                        }
                        (ValueType::UnicodeString | ValueType::Bytes, Value::Bytes(b)) => {
                            s.strm.write_bytes(&b)
                        }
                        (_, delta) => Err(Error::Runtime(format!(
                            "{} field's delta has unexpected type: {delta:?}",
                            self.name
                        ))),
                    }
                }
            },
            _ => Err(Error::Runtime(format!(
                "delta operator is not applicable to field {}",
                self.name
            ))),
        }
    }

    fn write_tail(&self, s: &mut EncoderContext, tail: Option<Value>) -> Result<()> {
        match self.value_type {
            ValueType::ASCIIString => match tail {
                None => self.write_ascii_string(s, None),
                Some(Value::ASCIIString(v)) => self.write_ascii_string(s, Some(&v)),
                Some(v) => Err(Error::Runtime(format!(
                    "{} field's tail must be ASCIIString, got: {v:?} instead",
                    self.name
                ))),
            },
            ValueType::UnicodeString | ValueType::Bytes => match tail {
                None => self.write_bytes(s, None),
                Some(Value::Bytes(b)) => self.write_bytes(s, Some(&b)),
                Some(v) => Err(Error::Runtime(format!(
                    "{} field's tail must be Bytes, got: {v:?} instead",
                    self.name
                ))),
            },
            _ => Err(Error::Runtime(format!(
                "tail operator is not applicable to field {}",
                self.name
            ))),
        }
    }

    fn no_value_error(&self) -> Error {
        Error::Runtime(format!("mandatory field {} has no value", self.name))
    }

    //
    // Decoding
    //

    /// Decode one field occurrence, the mirror of [`Instruction::inject`]. Dictionary
    /// writes mirror the encoder's exactly, so that the two sides agree on the previous
    /// values after every message.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn extract(&self, s: &mut DecoderContext) -> Result<Option<Value>> {
        match self.operator {
            Operator::None => {
                let v = self.read(s)?;
                if !self.value_type.is_vector() {
                    s.set_prev(self, PreviousValue::from_option(&v));
                }
                Ok(v)
            }

            // The constant operator specifies that the value of a field will always be the
            // initial value; it is never transferred.
            Operator::Constant => {
                let v = if !self.is_optional() || s.pmap_next_bit_set() {
                    self.initial_value.clone()
                } else {
                    None
                };
                s.set_prev(self, PreviousValue::from_option(&v));
                Ok(v)
            }

            // The default operator specifies that the value of a field is either present in
            // the stream or it will be the initial value.
            Operator::Default => {
                if s.pmap_next_bit_set() {
                    let v = self.read(s)?;
                    if v.is_some() {
                        s.set_prev(self, PreviousValue::from_option(&v));
                    }
                    Ok(v)
                } else {
                    if self.initial_value.is_none() && !self.is_optional() {
                        return Err(Error::Runtime(
                            "default operator has no initial value".to_string(),
                        ));
                    }
                    s.set_prev(self, PreviousValue::from_option(&self.initial_value));
                    Ok(self.initial_value.clone())
                }
            }

            // The copy operator specifies that the value of a field is optionally present
            // in the stream.
            Operator::Copy => {
                if s.pmap_next_bit_set() {
                    // If the value is present in the stream it becomes the new previous value.
                    let v = self.read(s)?;
                    s.set_prev(self, PreviousValue::from_option(&v));
                    return Ok(v);
                }
                // When the value is not present in the stream there are three cases
                // depending on the state of the previous value:
                match s.prev(self).clone() {
                    // Undefined: the value of the field is the initial value that also
                    // becomes the new previous value. Unless the field has optional
                    // presence, it is a dynamic error [ERR D5] if the instruction context
                    // has no initial value.
                    PreviousValue::Undefined => {
                        if self.initial_value.is_none() && !self.is_optional() {
                            return Err(Error::Runtime(
                                "copy operator has no initial value".to_string(),
                            )); // [ERR D5]
                        }
                        s.set_prev(self, PreviousValue::from_option(&self.initial_value));
                        Ok(self.initial_value.clone())
                    }
                    // Empty: if the field is optional the value is considered absent.
                    // It is a dynamic error [ERR D6] if the field is mandatory.
                    PreviousValue::Empty => {
                        if self.is_optional() {
                            Ok(None)
                        } else {
                            Err(s.empty_previous_error()) // [ERR D6]
                        }
                    }
                    // Assigned: the value of the field is the previous value.
                    PreviousValue::Assigned(v) => Ok(Some(v)),
                }
            }

            // The increment operator specifies that the value of a field is optionally
            // present in the stream.
            Operator::Increment => {
                if s.pmap_next_bit_set() {
                    let v = self.read(s)?;
                    s.set_prev(self, PreviousValue::from_option(&v));
                    return Ok(v);
                }
                match s.prev(self).clone() {
                    PreviousValue::Undefined => {
                        if self.initial_value.is_none() && !self.is_optional() {
                            return Err(Error::Runtime(
                                "increment operator has no initial value".to_string(),
                            )); // [ERR D5]
                        }
                        s.set_prev(self, PreviousValue::from_option(&self.initial_value));
                        Ok(self.initial_value.clone())
                    }
                    PreviousValue::Empty => {
                        if self.is_optional() {
                            Ok(None)
                        } else {
                            Err(s.empty_previous_error()) // [ERR D6]
                        }
                    }
                    // Assigned: the value of the field is the previous value incremented
                    // by one. The incremented value also becomes the new previous value.
                    PreviousValue::Assigned(p) => {
                        let v = p.checked_increment().ok_or_else(|| {
                            Error::Dynamic(DynamicError::OutOfRange {
                                detail: format!(
                                    "increment of field {} overflows its type",
                                    self.name
                                ),
                            })
                        })?;
                        s.set_prev(self, PreviousValue::Assigned(v.clone()));
                        Ok(Some(v))
                    }
                }
            }

            // The delta operator specifies that a delta value is always present in the stream.
            Operator::Delta => {
                // If the field has optional presence, the delta value can be NULL. In that
                // case the value of the field is considered absent and the previous value
                // is left untouched.
                let Some((delta, sub)) = self.read_delta(s)? else {
                    return Ok(None);
                };
                // Otherwise, the field is obtained by combining the delta value with a base
                // value that depends on the state of the previous value:
                let base = match s.prev(self) {
                    PreviousValue::Assigned(p) => p.clone(),
                    PreviousValue::Empty => {
                        return Err(s.empty_previous_error()); // [ERR D6]
                    }
                    PreviousValue::Undefined => match &self.initial_value {
                        Some(v) => v.clone(),
                        None => self.value_type.to_default_value()?,
                    },
                };
                let value = base.apply_delta(&delta, sub)?;
                s.set_prev(self, PreviousValue::Assigned(value.clone()));
                Ok(Some(value))
            }

            // The tail operator specifies that a tail value is optionally present in the stream.
            Operator::Tail => {
                if s.pmap_next_bit_set() {
                    let Some(tail) = self.read_tail(s)? else {
                        // A NULL tail marks an absent optional value and empties the
                        // previous value.
                        if self.is_optional() {
                            s.set_prev(self, PreviousValue::Empty);
                            return Ok(None);
                        }
                        return Err(Error::Runtime(
                            "tail operator received null for mandatory field".to_string(),
                        )); // [ERR D7]
                    };
                    let base = match s.prev(self) {
                        PreviousValue::Assigned(p) => p.clone(),
                        _ => match &self.initial_value {
                            Some(v) => v.clone(),
                            None => self.value_type.to_default_value()?,
                        },
                    };
                    let value = base.apply_tail(&tail)?;
                    s.set_prev(self, PreviousValue::Assigned(value.clone()));
                    return Ok(Some(value));
                }
                // If the tail value is not present in the stream, the value of the field
                // depends on the state of the previous value.
                match s.prev(self).clone() {
                    PreviousValue::Undefined => {
                        if self.initial_value.is_none() && !self.is_optional() {
                            return Err(Error::Runtime(
                                "tail operator has no initial value".to_string(),
                            )); // [ERR D6]
                        }
                        s.set_prev(self, PreviousValue::from_option(&self.initial_value));
                        Ok(self.initial_value.clone())
                    }
                    PreviousValue::Empty => {
                        if self.is_optional() {
                            Ok(None)
                        } else {
                            Err(s.empty_previous_error()) // [ERR D7]
                        }
                    }
                    PreviousValue::Assigned(v) => Ok(Some(v)),
                }
            }
        }
    }

    fn read(&self, s: &mut DecoderContext) -> Result<Option<Value>> {
        match self.value_type {
            ValueType::UInt32 | ValueType::Length => {
                Ok(self.read_uint32(s)?.map(Value::UInt32))
            }
            ValueType::UInt64 => Ok(self.read_uint64(s)?.map(Value::UInt64)),
            ValueType::Int32 => Ok(self.read_int32(s)?.map(Value::Int32)),
            ValueType::Int64 | ValueType::Mantissa => Ok(self.read_int64(s)?.map(Value::Int64)),
            ValueType::Exponent => Ok(self.read_exponent(s)?.map(Value::Int32)),
            ValueType::ASCIIString => Ok(self.read_ascii_string(s)?.map(Value::ASCIIString)),
            ValueType::UnicodeString => {
                Ok(self.read_unicode_string(s)?.map(Value::UnicodeString))
            }
            ValueType::Bytes => Ok(self.read_bytes(s)?.map(Value::Bytes)),
            // A scaled number is represented as a signed integer exponent followed by a
            // signed integer mantissa.
            ValueType::Decimal => {
                let Some((exponent, mantissa)) = self.read_decimal_components(s)? else {
                    return Ok(None);
                };
                Ok(Some(Value::Decimal(Decimal::new(exponent, mantissa))))
            }
            ValueType::Int32Vector | ValueType::Int64Vector => {
                Ok(self.read_int_vector(s)?.map(Value::IntVector))
            }
            ValueType::UInt32Vector | ValueType::UInt64Vector => {
                Ok(self.read_uint_vector(s)?.map(Value::UIntVector))
            }
            _ => Err(Error::Runtime(format!(
                "field {} of type {} cannot be read as a scalar",
                self.name,
                self.value_type.type_str()
            ))),
        }
    }

    fn read_uint32(&self, s: &mut DecoderContext) -> Result<Option<u32>> {
        let v = if self.is_nullable() {
            s.rdr.read_uint_nullable()?
        } else {
            Some(s.rdr.read_uint()?)
        };
        match v {
            None => Ok(None),
            Some(v) => {
                if v > u64::from(u32::MAX) {
                    return Err(Error::Dynamic(DynamicError::OutOfRange {
                        detail: format!("uInt32 value: {v}"),
                    })); // [ERR D2]
                }
                Ok(Some(v as u32))
            }
        }
    }

    fn read_uint64(&self, s: &mut DecoderContext) -> Result<Option<u64>> {
        if self.is_nullable() {
            s.rdr.read_uint_nullable()
        } else {
            Ok(Some(s.rdr.read_uint()?))
        }
    }

    fn read_int32(&self, s: &mut DecoderContext) -> Result<Option<i32>> {
        match self.read_int64(s)? {
            None => Ok(None),
            Some(v) => {
                if !INT32_RANGE.contains(&v) {
                    return Err(Error::Dynamic(DynamicError::OutOfRange {
                        detail: format!("int32 value: {v}"),
                    })); // [ERR D2]
                }
                Ok(Some(v as i32))
            }
        }
    }

    fn read_int64(&self, s: &mut DecoderContext) -> Result<Option<i64>> {
        if self.is_nullable() {
            s.rdr.read_int_nullable()
        } else {
            Ok(Some(s.rdr.read_int()?))
        }
    }

    fn read_exponent(&self, s: &mut DecoderContext) -> Result<Option<i32>> {
        let Some(e) = self.read_int32(s)? else {
            return Ok(None);
        };
        if !(MIN_EXPONENT..=MAX_EXPONENT).contains(&e) {
            return Err(Error::Dynamic(DynamicError::ExponentOutOfRange {
                exponent: e,
            })); // [ERR R1]
        }
        Ok(Some(e))
    }

    fn read_ascii_string(&self, s: &mut DecoderContext) -> Result<Option<String>> {
        if self.is_nullable() {
            s.rdr.read_ascii_string_nullable()
        } else {
            Ok(Some(s.rdr.read_ascii_string()?))
        }
    }

    fn read_unicode_string(&self, s: &mut DecoderContext) -> Result<Option<String>> {
        if self.is_nullable() {
            s.rdr.read_unicode_string_nullable()
        } else {
            Ok(Some(s.rdr.read_unicode_string()?))
        }
    }

    fn read_bytes(&self, s: &mut DecoderContext) -> Result<Option<Vec<u8>>> {
        if self.is_nullable() {
            s.rdr.read_bytes_nullable()
        } else {
            Ok(Some(s.rdr.read_bytes()?))
        }
    }

    fn read_decimal_components(&self, s: &mut DecoderContext) -> Result<Option<(i32, i64)>> {
        let exponent = self
            .instructions
            .first()
            .ok_or_else(|| Error::Runtime("exponent field not found".to_string()))?
            .extract(s)?;
        if exponent.is_none() {
            return Ok(None);
        }
        let mantissa = self
            .instructions
            .get(1)
            .ok_or_else(|| Error::Runtime("mantissa field not found".to_string()))?
            .extract(s)?;

        if let (Some(Value::Int32(e)), Some(Value::Int64(m))) = (exponent, mantissa) {
            Ok(Some((e, m)))
        } else {
            Err(Error::Runtime("exponent or mantissa not found".to_string()))
        }
    }

    fn read_int_vector(&self, s: &mut DecoderContext) -> Result<Option<Vec<i64>>> {
        let Some(length) = self.read_vector_length(s)? else {
            return Ok(None);
        };
        let mut v = Vec::with_capacity(length);
        for _ in 0..length {
            let x = s.rdr.read_int()?;
            if self.value_type == ValueType::Int32Vector && !INT32_RANGE.contains(&x) {
                return Err(Error::Dynamic(DynamicError::OutOfRange {
                    detail: format!("int32Vector element: {x}"),
                })); // [ERR D2]
            }
            v.push(x);
        }
        Ok(Some(v))
    }

    fn read_uint_vector(&self, s: &mut DecoderContext) -> Result<Option<Vec<u64>>> {
        let Some(length) = self.read_vector_length(s)? else {
            return Ok(None);
        };
        let mut v = Vec::with_capacity(length);
        for _ in 0..length {
            let x = s.rdr.read_uint()?;
            if self.value_type == ValueType::UInt32Vector && x > u64::from(u32::MAX) {
                return Err(Error::Dynamic(DynamicError::OutOfRange {
                    detail: format!("uInt32Vector element: {x}"),
                })); // [ERR D2]
            }
            v.push(x);
        }
        Ok(Some(v))
    }

    fn read_vector_length(&self, s: &mut DecoderContext) -> Result<Option<usize>> {
        let length = if self.is_nullable() {
            s.rdr.read_uint_nullable()?
        } else {
            Some(s.rdr.read_uint()?)
        };
        Ok(length.map(|l| l as usize))
    }

    // A delta for a string or byte vector field is framed by its subtraction length: a NULL
    // length marks an absent optional field, and the difference follows a non-NULL length
    // in a non-nullable representation.
    fn read_delta(&self, s: &mut DecoderContext) -> Result<Option<(Value, i32)>> {
        if self.value_type.is_integer() {
            return Ok(self.read_int64(s)?.map(|v| (Value::Int64(v), 0)));
        }
        match self.value_type {
            ValueType::ASCIIString | ValueType::UnicodeString | ValueType::Bytes => {
                let Some(sub) = self.read_int32(s)? else {
                    return Ok(None);
                };
                let diff = match self.value_type {
                    ValueType::ASCIIString => Value::ASCIIString(s.rdr.read_ascii_string()?),
                    _ => Value::Bytes(s.rdr.read_bytes()?),
                };
                Ok(Some((diff, sub)))
            }
            _ => Err(Error::Runtime(format!(
                "delta operator is not applicable to field {}",
                self.name
            ))),
        }
    }

    fn read_tail(&self, s: &mut DecoderContext) -> Result<Option<Value>> {
        match self.value_type {
            ValueType::ASCIIString => Ok(self.read_ascii_string(s)?.map(Value::ASCIIString)),
            ValueType::UnicodeString | ValueType::Bytes => {
                Ok(self.read_bytes(s)?.map(Value::Bytes))
            }
            _ => Err(Error::Runtime(format!(
                "tail operator is not applicable to field {}",
                self.name
            ))),
        }
    }
}
