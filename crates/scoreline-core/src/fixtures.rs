use std::sync::Arc;

use crate::{
    model::{Parameter, SynthDef},
    session::{AddSynthRequest, Session, SessionError, SessionOptions},
};

/// Opaque stand-in for a compiled definition; the engine never sees it in tests.
fn compiled_stub(name: &str) -> Vec<u8> {
    let mut bytes = b"SCgf".to_vec();
    bytes.extend_from_slice(&2_u32.to_be_bytes());
    bytes.extend_from_slice(name.as_bytes());
    bytes
}

#[must_use]
pub fn sine_synthdef() -> SynthDef {
    SynthDef::new(
        "sine",
        compiled_stub("sine"),
        vec![
            Parameter::control("frequency", 440.0),
            Parameter::control("amplitude", 0.1),
            Parameter::scalar("out", 0.0),
        ],
    )
}

/// Sustaining definition released through its `gate` control.
#[must_use]
pub fn default_synthdef() -> SynthDef {
    SynthDef::new(
        "default",
        compiled_stub("default"),
        vec![
            Parameter::control("frequency", 440.0),
            Parameter::control("amplitude", 0.1),
            Parameter::control("pan", 0.5),
            Parameter::control("gate", 1.0),
            Parameter::scalar("out", 0.0),
        ],
    )
}

/// Three overlapping sines: two from 0 (10s and 15s) and one from 5 (10s).
pub fn demo_session() -> Result<Session, SessionError> {
    demo_session_with_options(SessionOptions::default())
}

pub fn demo_session_with_options(options: SessionOptions) -> Result<Session, SessionError> {
    let synthdef = Arc::new(sine_synthdef());
    let mut session = Session::new(options).with_name("demo");
    {
        let mut moment = session.at(0.0)?;
        moment.add_synth(AddSynthRequest::new(Arc::clone(&synthdef)).duration(10.0))?;
        moment.add_synth(
            AddSynthRequest::new(Arc::clone(&synthdef))
                .duration(15.0)
                .param("frequency", 660.0),
        )?;
        moment.close()?;
    }
    {
        let mut moment = session.at(5.0)?;
        moment.add_synth(
            AddSynthRequest::new(synthdef)
                .duration(10.0)
                .param("frequency", 550.0),
        )?;
        moment.close()?;
    }
    Ok(session)
}
