//! Template registration: presence map sizing, dictionary slot layout, static
//! template references and the static validation rules.

use crate::base::instruction::Instruction;
use crate::base::value::ValueType;
use crate::{Encoder, Error};

fn encoder(templates_xml: &str) -> crate::Result<Encoder> {
    Encoder::new_from_xml(&format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<templates xmlns="http://www.fixprotocol.org/ns/fast/td/1.1">{templates_xml}</templates>"#
    ))
}

#[test]
fn segment_pmap_sizes() {
    let enc = encoder(
        r#"
        <template id="1" name="Msg">
            <uInt32 id="1" name="A"><copy/></uInt32>
            <uInt64 id="2" name="B"/>
            <string id="3" name="C"><delta/></string>
            <group name="G" presence="optional">
                <uInt32 id="4" name="D"><default value="1"/></uInt32>
                <uInt32 id="5" name="E"/>
            </group>
            <sequence name="S">
                <length id="6"><copy/></length>
                <uInt32 id="7" name="F"><increment value="1"/></uInt32>
                <uInt32 id="8" name="H"/>
            </sequence>
        </template>"#,
    )
    .unwrap();

    let template = &enc.repo.templates()[0];
    // template id + copy + optional group + sequence length copy
    assert_eq!(template.segment_pmap_size, 4);

    let group = &template.instructions[3];
    assert_eq!(group.value_type, ValueType::Group);
    assert_eq!(group.segment_pmap_size, 1);

    let sequence = &template.instructions[4];
    assert_eq!(sequence.value_type, ValueType::Sequence);
    assert_eq!(sequence.segment_pmap_size, 1);
}

#[test]
fn group_without_operators_needs_no_pmap() {
    let enc = encoder(
        r#"
        <template id="1" name="Msg">
            <group name="G">
                <uInt32 id="1" name="A"/>
                <string id="2" name="B"/>
            </group>
        </template>"#,
    )
    .unwrap();
    let group = &enc.repo.templates()[0].instructions[0];
    assert_eq!(group.segment_pmap_size, 0);
}

#[test]
fn slots_are_unique() {
    let enc = encoder(
        r#"
        <template id="1" name="Msg">
            <uInt32 id="1" name="A"><copy/></uInt32>
            <decimal id="2" name="B"><delta/></decimal>
            <sequence name="S">
                <uInt32 id="3" name="C"><copy/></uInt32>
            </sequence>
        </template>
        <template id="2" name="Other">
            <uInt32 id="1" name="A"><copy/></uInt32>
        </template>"#,
    )
    .unwrap();

    fn collect(instructions: &[Instruction], slots: &mut Vec<usize>) {
        for i in instructions {
            match i.value_type {
                ValueType::Group | ValueType::Sequence => collect(&i.instructions, slots),
                ValueType::Decimal => {
                    slots.push(i.slot);
                    collect(&i.instructions, slots);
                }
                ValueType::TemplateReference => {}
                _ => slots.push(i.slot),
            }
        }
    }

    let mut slots = Vec::new();
    for t in enc.repo.templates() {
        collect(&t.instructions, &mut slots);
    }
    let count = slots.len();
    slots.sort_unstable();
    slots.dedup();
    assert_eq!(slots.len(), count, "every instruction owns its own slot");
    assert_eq!(enc.repo.slot_count(), count);
}

#[test]
fn static_template_reference_is_spliced() {
    let enc = encoder(
        r#"
        <template name="Header">
            <uInt32 id="34" name="MsgSeqNum"><increment value="1"/></uInt32>
            <uInt64 id="52" name="SendingTime"/>
        </template>
        <template id="1" name="Heartbeat">
            <templateRef name="Header"/>
            <string id="58" name="Text" presence="optional"/>
        </template>"#,
    )
    .unwrap();

    let heartbeat = enc.template_with_id(1).unwrap();
    let fields: Vec<&str> = heartbeat
        .instructions
        .iter()
        .map(|i| i.name.as_ref())
        .collect();
    assert_eq!(fields, vec!["MsgSeqNum", "SendingTime", "Text"]);

    // the spliced copy tracks previous values independently of the source template
    let header = &enc.repo.templates()[0];
    assert_ne!(
        header.instructions[0].slot,
        heartbeat.instructions[0].slot
    );
}

#[test]
fn static_reference_must_follow_its_target() {
    let err = encoder(
        r#"
        <template id="1" name="Heartbeat">
            <templateRef name="Header"/>
        </template>
        <template name="Header">
            <uInt32 id="34" name="MsgSeqNum"/>
        </template>"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Static(_)));
}

#[test]
fn duplicate_ids_and_names_are_rejected() {
    let err = encoder(
        r#"
        <template id="1" name="A"><uInt32 id="1" name="X"/></template>
        <template id="1" name="B"><uInt32 id="1" name="X"/></template>"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Static(_)));

    let err = encoder(
        r#"
        <template id="1" name="A"><uInt32 id="1" name="X"/></template>
        <template id="2" name="A"><uInt32 id="1" name="X"/></template>"#,
    )
    .unwrap_err();
    assert!(matches!(err, Error::Static(_)));
}

#[test]
fn operator_type_rules() {
    // constant requires an initial value
    assert!(matches!(
        encoder(r#"<template id="1" name="T"><uInt32 id="1" name="X"><constant/></uInt32></template>"#),
        Err(Error::Static(_))
    ));
    // mandatory default requires an initial value
    assert!(matches!(
        encoder(r#"<template id="1" name="T"><uInt32 id="1" name="X"><default/></uInt32></template>"#),
        Err(Error::Static(_))
    ));
    // increment applies to integers only
    assert!(matches!(
        encoder(r#"<template id="1" name="T"><string id="1" name="X"><increment/></string></template>"#),
        Err(Error::Static(_))
    ));
    // tail applies to strings and byte vectors only
    assert!(matches!(
        encoder(r#"<template id="1" name="T"><uInt32 id="1" name="X"><tail/></uInt32></template>"#),
        Err(Error::Static(_))
    ));
    // integer vectors take no operators at all
    assert!(matches!(
        encoder(r#"<template id="1" name="T"><int64Vector id="1" name="X"><copy/></int64Vector></template>"#),
        Err(Error::Static(_))
    ));
    // a scalar field must carry a non-zero id
    assert!(matches!(
        encoder(r#"<template id="1" name="T"><uInt32 name="X"/></template>"#),
        Err(Error::Static(_))
    ));
}

#[test]
fn oversized_segment_pmap_is_rejected() {
    let mut fields = String::new();
    for i in 0..64 {
        fields.push_str(&format!(r#"<uInt32 id="{}" name="F{i}"><copy/></uInt32>"#, i + 1));
    }
    let err = encoder(&format!(r#"<template id="1" name="Wide">{fields}</template>"#)).unwrap_err();
    assert!(matches!(err, Error::Static(_)));
}

#[test]
fn include_xml_extends_the_repository() {
    let mut enc = encoder(r#"<template id="1" name="A"><uInt32 id="1" name="X"/></template>"#).unwrap();
    assert!(enc.template_with_id(2).is_none());

    enc.include_xml(
        r#"<templates xmlns="http://www.fixprotocol.org/ns/fast/td/1.1">
            <template id="2" name="B"><uInt32 id="1" name="X"><copy/></uInt32></template>
        </templates>"#,
    )
    .unwrap();
    assert_eq!(enc.template_with_id(2).unwrap().name(), "B");

    // two encodable templates: no active id can be preset anymore
    assert_eq!(enc.active_template_id, None);
}
