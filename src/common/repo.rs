use std::rc::Rc;

use hashbrown::HashMap;

use crate::base::instruction::Instruction;
use crate::base::types::Template;
use crate::base::value::ValueType;
use crate::common::dictionary::Dictionary;
use crate::{Error, Result};

// Presence maps are accumulated in a u64, seven bits per byte on the wire.
const MAX_SEGMENT_PMAP_BITS: usize = 63;

/// Holds the registered templates and the layout of the previous-value arena.
///
/// Building the repository freezes the instruction trees: static template references
/// are spliced into their referencing templates, every operator-bearing instruction
/// gets a dictionary slot, and the worst-case presence map size of every segment
/// is computed. After that the trees are only ever read.
#[derive(Debug)]
pub(crate) struct TemplateRepo {
    templates: Vec<Rc<Template>>,
    by_id: HashMap<u32, Rc<Template>>,
    by_name: HashMap<String, Rc<Template>>,
    slot_count: usize,
}

impl TemplateRepo {
    pub(crate) fn build(templates: Vec<Template>) -> Result<Self> {
        let mut repo = Self {
            templates: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            slot_count: 0,
        };
        repo.add(templates)?;
        Ok(repo)
    }

    /// Register more templates. A template may statically reference any template
    /// registered before it, including earlier entries of the same batch.
    pub(crate) fn add(&mut self, templates: Vec<Template>) -> Result<()> {
        for mut t in templates {
            if t.id != 0 && self.by_id.contains_key(&t.id) {
                return Err(Error::Static(format!("duplicate template id: {}", t.id)));
            }
            if self.by_name.contains_key(&t.name) {
                return Err(Error::Static(format!("duplicate template name: {}", t.name)));
            }
            self.splice_static_refs(&mut t.instructions)?;

            let mut bits = 1; // the template id bit
            for i in &mut t.instructions {
                bits += Self::finalize(i, &mut self.slot_count)?;
            }
            Self::check_pmap_width(bits, &t.name)?;
            t.segment_pmap_size = bits;

            let t = Rc::new(t);
            if t.id != 0 {
                self.by_id.insert(t.id, t.clone());
            }
            self.by_name.insert(t.name.clone(), t.clone());
            self.templates.push(t);
        }
        Ok(())
    }

    pub(crate) fn find(&self, id: u32) -> Option<&Rc<Template>> {
        self.by_id.get(&id)
    }

    pub(crate) fn get_template(&self, id: u32) -> Option<&Template> {
        self.by_id.get(&id).map(Rc::as_ref)
    }

    /// The sole encodable template, if exactly one is registered. Used to preset the
    /// active template id so single-template streams can omit the id on the wire.
    pub(crate) fn unique_entry(&self) -> Option<&Rc<Template>> {
        if self.by_id.len() == 1 {
            self.by_id.values().next()
        } else {
            None
        }
    }

    pub(crate) fn templates(&self) -> &[Rc<Template>] {
        &self.templates
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub(crate) fn new_dictionary(&self) -> Dictionary {
        Dictionary::new(self.slot_count)
    }

    // Replace every static template reference by a copy of the referenced template's
    // fields. The copies are given their own dictionary slots when this template is
    // finalized, so each inclusion site tracks previous values independently.
    fn splice_static_refs(&self, instructions: &mut Vec<Instruction>) -> Result<()> {
        let mut idx = 0;
        while idx < instructions.len() {
            let is_static_ref = instructions[idx].value_type == ValueType::TemplateReference
                && !instructions[idx].name.is_empty();
            if is_static_ref {
                let name = instructions[idx].name.clone();
                let template = self.by_name.get(name.as_ref()).ok_or_else(|| {
                    Error::Static(format!(
                        "template '{name}' not found; a static reference must follow its target"
                    ))
                })?;
                let fields = template.instructions.to_vec();
                instructions.splice(idx..=idx, fields);
                // The spliced fields came from a finalized template and contain no
                // further static references; the loop moves over them normally.
            } else {
                if matches!(
                    instructions[idx].value_type,
                    ValueType::Group | ValueType::Sequence
                ) {
                    self.splice_static_refs(&mut instructions[idx].instructions)?;
                }
                idx += 1;
            }
        }
        Ok(())
    }

    // Assign dictionary slots and compute segment pmap sizes, returning the number of
    // presence map bits the instruction occupies in its enclosing segment.
    fn finalize(i: &mut Instruction, next_slot: &mut usize) -> Result<usize> {
        match i.value_type {
            ValueType::Group => {
                let mut inner = 0;
                for c in &mut i.instructions {
                    inner += Self::finalize(c, next_slot)?;
                }
                Self::check_pmap_width(inner, &i.name)?;
                i.segment_pmap_size = inner;
                Ok(usize::from(i.is_optional()))
            }
            ValueType::Sequence => {
                let mut children = i.instructions.iter_mut();
                let length = children.next().ok_or_else(|| {
                    Error::Static(format!("sequence '{}' has no length field", i.name))
                })?;
                // The length is a synthetic field of the enclosing segment; only the
                // element fields are protected by the element pmap.
                let length_bits = Self::finalize(length, next_slot)?;
                let mut inner = 0;
                for c in children {
                    inner += Self::finalize(c, next_slot)?;
                }
                Self::check_pmap_width(inner, &i.name)?;
                i.segment_pmap_size = inner;
                Ok(length_bits)
            }
            // Only dynamic references remain after splicing; the referenced template
            // brings its own segment and pmap.
            ValueType::TemplateReference => Ok(0),
            ValueType::Decimal => {
                i.slot = Self::alloc_slot(next_slot);
                let mut bits = i.pmap_bits();
                for c in &mut i.instructions {
                    bits += Self::finalize(c, next_slot)?;
                }
                Ok(bits)
            }
            _ => {
                i.slot = Self::alloc_slot(next_slot);
                Ok(i.pmap_bits())
            }
        }
    }

    fn alloc_slot(next_slot: &mut usize) -> usize {
        let slot = *next_slot;
        *next_slot += 1;
        slot
    }

    fn check_pmap_width(bits: usize, name: &str) -> Result<()> {
        if bits > MAX_SEGMENT_PMAP_BITS {
            return Err(Error::Static(format!(
                "segment '{name}' needs {bits} presence map bits, more than the supported {MAX_SEGMENT_PMAP_BITS}"
            )));
        }
        Ok(())
    }
}
