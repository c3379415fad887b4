use roxmltree::Node;

use crate::base::instruction::Instruction;
use crate::{Error, Result};

/// A template contains a sequence of instructions. The order of the instructions is significant
/// and corresponds to the order of the data in the stream.
#[derive(Debug)]
pub struct Template {
    pub(crate) id: u32,
    pub(crate) name: String,
    pub(crate) instructions: Vec<Instruction>,

    // Set by the `reset` attribute: the dictionary is cleared at the start of
    // every segment encoded or decoded with this template.
    pub(crate) reset: bool,

    // Number of presence map bits a segment of this template needs at most,
    // including the leading template id bit. Computed by the template repository.
    pub(crate) segment_pmap_size: usize,
}

impl Template {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn from_node(node: Node) -> Result<Self> {
        if node.tag_name().name() != "template" {
            return Err(Error::Static(format!(
                "expected <template/> node, got <{}/>",
                node.tag_name().name()
            )));
        }
        let id = node.attribute("id").unwrap_or("0").parse::<u32>()?;
        let name = node
            .attribute("name")
            .ok_or_else(|| Error::Static("template name not found".to_string()))?
            .to_string();
        let reset = matches!(node.attribute("reset"), Some("yes") | Some("true"));
        let mut instructions = Vec::new();
        for child in node.children() {
            if child.is_element() {
                instructions.push(Instruction::from_node(child)?);
            }
        }
        Ok(Self {
            id,
            name,
            instructions,
            reset,
            segment_pmap_size: 0,
        })
    }
}

/// Parse a `<templates>` document into its template definitions.
pub(crate) fn templates_from_xml(text: &str) -> Result<Vec<Template>> {
    let doc = roxmltree::Document::parse(text)?;
    let root = doc
        .root()
        .first_child()
        .ok_or_else(|| Error::Static("no root element found".to_string()))?;
    if root.tag_name().name() != "templates" {
        return Err(Error::Static("<templates/> node not found".to_string()));
    }
    let mut templates = Vec::new();
    for child in root.children() {
        if child.is_element() {
            templates.push(Template::from_node(child)?);
        }
    }
    Ok(templates)
}


/// Field operators specify ways to optimize the encoding of a field.
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Operator {
    None,
    Constant,
    Default,
    Copy,
    Increment,
    Delta,
    Tail,
}

impl Operator {
    pub(crate) fn new_from_tag(t: &str) -> Result<Self> {
        match t {
            "constant" => Ok(Self::Constant),
            "default" => Ok(Self::Default),
            "copy" => Ok(Self::Copy),
            "increment" => Ok(Self::Increment),
            "delta" => Ok(Self::Delta),
            "tail" => Ok(Self::Tail),
            _ => Err(Error::Static(format!("Unknown operator: {t}"))),
        }
    }
}


/// The optional presence attribute indicates whether the field is mandatory or optional.
#[derive(Debug, PartialEq, Copy, Clone)]
pub enum Presence {
    Mandatory,
    Optional,
}

impl Presence {
    pub(crate) fn from_str(s: &str) -> Result<Self> {
        match s {
            "mandatory" => Ok(Self::Mandatory),
            "optional" => Ok(Self::Optional),
            _ => Err(Error::Static(format!("unknown presence: {s}"))),
        }
    }
}
