use bytes::BytesMut;

use crate::base::value::Value;
use crate::common::dictionary::PreviousValue;
use crate::encoder::encoder::EncoderContext;
use crate::{Encoder, Result};

mod templates;

/// Build an encoder whose only template wraps the given field definition.
fn field_encoder(field_xml: &str) -> Encoder {
    let xml = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<templates xmlns="http://www.fixprotocol.org/ns/fast/td/1.1">
    <template id="1" name="Test">{field_xml}</template>
</templates>"#
    );
    Encoder::new_from_xml(&xml).unwrap()
}

/// Run a single field through its operator against a bare seven-bit presence map,
/// the way one segment slot would see it.
fn encode_field(enc: &mut Encoder, value: Option<Value>) -> Result<Vec<u8>> {
    let template = enc.repo.templates()[0].clone();
    let mut buf = BytesMut::new();
    let mut ctx = EncoderContext::new(enc, &mut buf);
    ctx.setup_pmap(7)?;
    template.instructions[0].inject(&mut ctx, &value)?;
    ctx.commit_pmap()?;
    drop(ctx);
    Ok(buf.to_vec())
}

/// Previous value of the first field of the first template.
fn prev_state(enc: &Encoder) -> PreviousValue {
    enc.dictionary
        .get(enc.repo.templates()[0].instructions[0].slot)
        .clone()
}

/// Seed the previous value of the first field of the first template.
fn seed_prev(enc: &mut Encoder, value: PreviousValue) {
    let slot = enc.repo.templates()[0].instructions[0].slot;
    enc.dictionary.set(slot, value);
}
