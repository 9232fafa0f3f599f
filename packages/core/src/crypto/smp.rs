//! Socialist Millionaires' Protocol
//!
//! Both sides learn whether they hold the same secret and nothing else.
//! Written additively over Ristretto255 (`g*a` is g to the a).
//!
//! ```text
//! Alice (x)                                   Bob (y)
//! SMP1: g2a, g3a + proofs (1, 2)        →
//!                                       ←     SMP2: g2b, g3b + proofs (3, 4),
//!                                                   Pb = g3*r, Qb = g*r + g2*y + proof (5)
//! SMP3: Pa, Qa + proof (6),             →
//!       Ra = (Qa-Qb)*a3 + proof (7)
//!                                       ←     SMP4: Rb = (Qa-Qb)*b3 + proof (8)
//! Rab = Rb*a3 == Pa-Pb ?                      Rab = Ra*b3 == Pa-Pb ?
//! ```
//!
//! Every received element and proof is checked before the state advances; a
//! failed check resets the machine and reports `SmpVerificationError`.

use crate::crypto::group::{
    decode_element, decode_scalar, encode_element, encode_scalar, generator, hash_bytes_to_scalar,
    hash_to_scalar, random_scalar, Element,
};
use crate::protocol::messages::{
    SmpMessage1, SmpMessage2, SmpMessage3, SmpMessage4, WireElement, WireScalar,
};
use crate::utils::error::{OtrError, Result};
use curve25519_dalek::scalar::Scalar;
use zeroize::Zeroizing;

/// Secret exponent, wiped on drop.
pub type SmpSecret = Zeroizing<Scalar>;

const SECRET_BINDING_VERSION: u8 = 1;

/// Final result of one SMP run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpOutcome {
    Success,
    Failed,
    Aborted,
}

/// Externally visible SMP state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmpPhase {
    Expect1,
    /// SMP1 received; waiting for the local user's secret.
    AwaitingSecret,
    Expect2,
    Expect3,
    Expect4,
    Done,
}

enum SmpState {
    Expect1,
    AwaitingSecret {
        g2a: Element,
        g3a: Element,
    },
    Expect2 {
        x: SmpSecret,
        a2: SmpSecret,
        a3: SmpSecret,
    },
    Expect3 {
        g3a: Element,
        g2: Element,
        g3: Element,
        b3: SmpSecret,
        pb: Element,
        qb: Element,
    },
    Expect4 {
        g3b: Element,
        pa_minus_pb: Element,
        qa_minus_qb: Element,
        a3: SmpSecret,
    },
    Done,
}

/// Bind the user's secret to both long-term fingerprints and the session id.
///
/// `initiator_fingerprint` belongs to whoever sent SMP1.
pub fn bind_secret(
    initiator_fingerprint: &str,
    responder_fingerprint: &str,
    ssid: &[u8],
    secret: &[u8],
) -> SmpSecret {
    let mut input = Zeroizing::new(Vec::with_capacity(
        1 + initiator_fingerprint.len() + responder_fingerprint.len() + ssid.len() + secret.len(),
    ));
    input.push(SECRET_BINDING_VERSION);
    input.extend_from_slice(initiator_fingerprint.as_bytes());
    input.extend_from_slice(responder_fingerprint.as_bytes());
    input.extend_from_slice(ssid);
    input.extend_from_slice(secret);
    Zeroizing::new(hash_bytes_to_scalar(&input))
}

/// Discrete-log proof: `c = h(label, g*r)`, `d = r - exponent*c`.
fn prove_log(label: u8, exponent: &Scalar) -> (WireScalar, WireScalar) {
    let r = Zeroizing::new(random_scalar());
    let c = hash_to_scalar(label, &[&(generator() * *r)]);
    let d = *r - exponent * c;
    (encode_scalar(&c), encode_scalar(&d))
}

/// Check `c == h(label, g*d + element*c)`.
fn verify_log(label: u8, element: &Element, c: &WireScalar, d: &WireScalar) -> Result<()> {
    let c = decode_scalar(c)?;
    let d = decode_scalar(d)?;
    let expected = hash_to_scalar(label, &[&(generator() * d + element * c)]);
    if expected != c {
        return Err(OtrError::SmpVerificationError(format!(
            "proof {} does not verify",
            label
        )));
    }
    Ok(())
}

fn element(bytes: &WireElement) -> Result<Element> {
    decode_element(bytes).map_err(|e| OtrError::SmpVerificationError(e.to_string()))
}

/// Per-conversation SMP driver.
pub struct SmpStateMachine {
    state: SmpState,
    outcome: Option<SmpOutcome>,
    question: Option<String>,
}

impl Default for SmpStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SmpStateMachine {
    pub fn new() -> Self {
        Self {
            state: SmpState::Expect1,
            outcome: None,
            question: None,
        }
    }

    pub fn phase(&self) -> SmpPhase {
        match self.state {
            SmpState::Expect1 => SmpPhase::Expect1,
            SmpState::AwaitingSecret { .. } => SmpPhase::AwaitingSecret,
            SmpState::Expect2 { .. } => SmpPhase::Expect2,
            SmpState::Expect3 { .. } => SmpPhase::Expect3,
            SmpState::Expect4 { .. } => SmpPhase::Expect4,
            SmpState::Done => SmpPhase::Done,
        }
    }

    /// Outcome of the most recent run; `None` while running or before any run.
    pub fn outcome(&self) -> Option<SmpOutcome> {
        self.outcome
    }

    /// Question attached to the SMP1 we are answering, if any.
    pub fn question(&self) -> Option<&str> {
        self.question.as_deref()
    }

    pub fn in_progress(&self) -> bool {
        !matches!(self.state, SmpState::Expect1 | SmpState::Done)
    }

    /// Abort a running exchange. Returns whether there was one.
    pub fn abort(&mut self) -> bool {
        use tracing::debug;

        let was_running = self.in_progress();
        if was_running {
            debug!(target: "otr::smp", phase = ?self.phase(), "SMP aborted");
            self.outcome = Some(SmpOutcome::Aborted);
        }
        self.state = SmpState::Expect1;
        self.question = None;
        was_running
    }

    /// Start a new exchange with our bound secret. Returns SMP1.
    pub fn start(&mut self, x: SmpSecret) -> Result<SmpMessage1> {
        use tracing::debug;

        if self.in_progress() {
            return Err(OtrError::InvalidState("SMP already in progress".to_string()));
        }

        let a2 = Zeroizing::new(random_scalar());
        let a3 = Zeroizing::new(random_scalar());
        let (c2, d2) = prove_log(1, &a2);
        let (c3, d3) = prove_log(2, &a3);
        let message = SmpMessage1 {
            g2a: encode_element(&(generator() * *a2)),
            c2,
            d2,
            g3a: encode_element(&(generator() * *a3)),
            c3,
            d3,
        };

        debug!(target: "otr::smp", "SMP started");
        self.state = SmpState::Expect2 { x, a2, a3 };
        self.outcome = None;
        self.question = None;
        Ok(message)
    }

    /// Accept SMP1 from the peer; the user must then supply a secret via
    /// [`respond`](Self::respond).
    pub fn receive_smp1(&mut self, message: &SmpMessage1, question: Option<String>) -> Result<()> {
        use tracing::debug;

        if self.in_progress() {
            return Err(self.unexpected("SMP1"));
        }

        let checked = (|| -> Result<(Element, Element)> {
            let g2a = element(&message.g2a)?;
            let g3a = element(&message.g3a)?;
            verify_log(1, &g2a, &message.c2, &message.d2)?;
            verify_log(2, &g3a, &message.c3, &message.d3)?;
            Ok((g2a, g3a))
        })();
        let (g2a, g3a) = self.check(checked)?;

        debug!(target: "otr::smp", has_question = question.is_some(), "SMP1 verified, awaiting secret");
        self.state = SmpState::AwaitingSecret { g2a, g3a };
        self.outcome = None;
        self.question = question;
        Ok(())
    }

    /// Answer a received SMP1 with our bound secret. Returns SMP2.
    pub fn respond(&mut self, y: SmpSecret) -> Result<SmpMessage2> {
        use tracing::debug;

        let (g2a, g3a) = match &self.state {
            SmpState::AwaitingSecret { g2a, g3a } => (*g2a, *g3a),
            _ => return Err(OtrError::InvalidState("no SMP request to answer".to_string())),
        };
        let g = generator();

        let b2 = Zeroizing::new(random_scalar());
        let b3 = Zeroizing::new(random_scalar());
        let (c2, d2) = prove_log(3, &b2);
        let (c3, d3) = prove_log(4, &b3);

        let g2 = g2a * *b2;
        let g3 = g3a * *b3;

        let r = Zeroizing::new(random_scalar());
        let pb = g3 * *r;
        let qb = g * *r + g2 * *y;

        let r4 = Zeroizing::new(random_scalar());
        let r5 = Zeroizing::new(random_scalar());
        let cp = hash_to_scalar(5, &[&(g3 * *r4), &(g * *r4 + g2 * *r5)]);
        let d5 = *r4 - *r * cp;
        let d6 = *r5 - *y * cp;

        let message = SmpMessage2 {
            g2b: encode_element(&(g * *b2)),
            c2,
            d2,
            g3b: encode_element(&(g * *b3)),
            c3,
            d3,
            pb: encode_element(&pb),
            qb: encode_element(&qb),
            cp: encode_scalar(&cp),
            d5: encode_scalar(&d5),
            d6: encode_scalar(&d6),
        };

        debug!(target: "otr::smp", "SMP2 sent");
        self.state = SmpState::Expect3 {
            g3a,
            g2,
            g3,
            b3,
            pb,
            qb,
        };
        Ok(message)
    }

    /// Process SMP2. Returns SMP3.
    pub fn receive_smp2(&mut self, message: &SmpMessage2) -> Result<SmpMessage3> {
        use tracing::debug;

        let (x, a2, a3) = match std::mem::replace(&mut self.state, SmpState::Expect1) {
            SmpState::Expect2 { x, a2, a3 } => (x, a2, a3),
            other => {
                self.state = other;
                return Err(self.unexpected("SMP2"));
            }
        };
        let g = generator();

        let checked = (|| -> Result<(Element, Element, Element, Element, Element)> {
            let g2b = element(&message.g2b)?;
            let g3b = element(&message.g3b)?;
            let pb = element(&message.pb)?;
            let qb = element(&message.qb)?;
            verify_log(3, &g2b, &message.c2, &message.d2)?;
            verify_log(4, &g3b, &message.c3, &message.d3)?;

            let g2 = g2b * *a2;
            let g3 = g3b * *a3;
            let cp = decode_scalar(&message.cp)?;
            let d5 = decode_scalar(&message.d5)?;
            let d6 = decode_scalar(&message.d6)?;
            let expected = hash_to_scalar(5, &[&(g3 * d5 + pb * cp), &(g * d5 + g2 * d6 + qb * cp)]);
            if expected != cp {
                return Err(OtrError::SmpVerificationError("proof 5 does not verify".to_string()));
            }
            Ok((g3b, g2, g3, pb, qb))
        })();
        let (g3b, g2, g3, pb, qb) = self.check(checked)?;

        let r = Zeroizing::new(random_scalar());
        let pa = g3 * *r;
        let qa = g * *r + g2 * *x;

        let r5 = Zeroizing::new(random_scalar());
        let r6 = Zeroizing::new(random_scalar());
        let cp = hash_to_scalar(6, &[&(g3 * *r5), &(g * *r5 + g2 * *r6)]);
        let d5 = *r5 - *r * cp;
        let d6 = *r6 - *x * cp;

        let qa_minus_qb = qa - qb;
        let ra = qa_minus_qb * *a3;
        let r7 = Zeroizing::new(random_scalar());
        let cr = hash_to_scalar(7, &[&(g * *r7), &(qa_minus_qb * *r7)]);
        let d7 = *r7 - *a3 * cr;

        let message = SmpMessage3 {
            pa: encode_element(&pa),
            qa: encode_element(&qa),
            cp: encode_scalar(&cp),
            d5: encode_scalar(&d5),
            d6: encode_scalar(&d6),
            ra: encode_element(&ra),
            cr: encode_scalar(&cr),
            d7: encode_scalar(&d7),
        };

        debug!(target: "otr::smp", "SMP2 verified, SMP3 sent");
        self.state = SmpState::Expect4 {
            g3b,
            pa_minus_pb: pa - pb,
            qa_minus_qb,
            a3,
        };
        Ok(message)
    }

    /// Process SMP3. Returns SMP4; the outcome is decided.
    pub fn receive_smp3(&mut self, message: &SmpMessage3) -> Result<SmpMessage4> {
        use tracing::info;

        let (g3a, g2, g3, b3, pb, qb) = match std::mem::replace(&mut self.state, SmpState::Expect1) {
            SmpState::Expect3 {
                g3a,
                g2,
                g3,
                b3,
                pb,
                qb,
            } => (g3a, g2, g3, b3, pb, qb),
            other => {
                self.state = other;
                return Err(self.unexpected("SMP3"));
            }
        };
        let g = generator();

        let checked = (|| -> Result<(Element, Element, Element)> {
            let pa = element(&message.pa)?;
            let qa = element(&message.qa)?;
            let ra = element(&message.ra)?;

            let cp = decode_scalar(&message.cp)?;
            let d5 = decode_scalar(&message.d5)?;
            let d6 = decode_scalar(&message.d6)?;
            let expected = hash_to_scalar(6, &[&(g3 * d5 + pa * cp), &(g * d5 + g2 * d6 + qa * cp)]);
            if expected != cp {
                return Err(OtrError::SmpVerificationError("proof 6 does not verify".to_string()));
            }

            let qa_minus_qb = qa - qb;
            let cr = decode_scalar(&message.cr)?;
            let d7 = decode_scalar(&message.d7)?;
            let expected = hash_to_scalar(7, &[&(g * d7 + g3a * cr), &(qa_minus_qb * d7 + ra * cr)]);
            if expected != cr {
                return Err(OtrError::SmpVerificationError("proof 7 does not verify".to_string()));
            }
            Ok((pa, qa_minus_qb, ra))
        })();
        let (pa, qa_minus_qb, ra) = self.check(checked)?;

        let rb = qa_minus_qb * *b3;
        let r7 = Zeroizing::new(random_scalar());
        let cr = hash_to_scalar(8, &[&(g * *r7), &(qa_minus_qb * *r7)]);
        let d7 = *r7 - *b3 * cr;

        let rab = ra * *b3;
        let outcome = if rab == pa - pb {
            SmpOutcome::Success
        } else {
            SmpOutcome::Failed
        };
        info!(target: "otr::smp", outcome = ?outcome, "SMP finished");

        self.state = SmpState::Done;
        self.outcome = Some(outcome);
        Ok(SmpMessage4 {
            rb: encode_element(&rb),
            cr: encode_scalar(&cr),
            d7: encode_scalar(&d7),
        })
    }

    /// Process SMP4; the outcome is decided.
    pub fn receive_smp4(&mut self, message: &SmpMessage4) -> Result<SmpOutcome> {
        use tracing::info;

        let (g3b, pa_minus_pb, qa_minus_qb, a3) = match std::mem::replace(&mut self.state, SmpState::Expect1) {
            SmpState::Expect4 {
                g3b,
                pa_minus_pb,
                qa_minus_qb,
                a3,
            } => (g3b, pa_minus_pb, qa_minus_qb, a3),
            other => {
                self.state = other;
                return Err(self.unexpected("SMP4"));
            }
        };
        let g = generator();

        let checked = (|| -> Result<Element> {
            let rb = element(&message.rb)?;
            let cr = decode_scalar(&message.cr)?;
            let d7 = decode_scalar(&message.d7)?;
            let expected = hash_to_scalar(8, &[&(g * d7 + g3b * cr), &(qa_minus_qb * d7 + rb * cr)]);
            if expected != cr {
                return Err(OtrError::SmpVerificationError("proof 8 does not verify".to_string()));
            }
            Ok(rb)
        })();
        let rb = self.check(checked)?;

        let rab = rb * *a3;
        let outcome = if rab == pa_minus_pb {
            SmpOutcome::Success
        } else {
            SmpOutcome::Failed
        };
        info!(target: "otr::smp", outcome = ?outcome, "SMP finished");

        self.state = SmpState::Done;
        self.outcome = Some(outcome);
        Ok(outcome)
    }

    /// On a failed check: back to `Expect1`, run marked failed.
    fn check<T>(&mut self, result: Result<T>) -> Result<T> {
        use tracing::warn;

        result.map_err(|err| {
            warn!(target: "otr::smp", error = %err, "SMP verification failed");
            self.state = SmpState::Expect1;
            self.outcome = Some(SmpOutcome::Failed);
            self.question = None;
            match err {
                OtrError::CryptoError(e) => OtrError::SmpVerificationError(e.to_string()),
                other => other,
            }
        })
    }

    /// A message that does not fit the current step aborts the run.
    fn unexpected(&mut self, kind: &str) -> OtrError {
        use tracing::debug;

        debug!(target: "otr::smp", kind = kind, phase = ?self.phase(), "Unexpected SMP message");
        if self.in_progress() {
            self.outcome = Some(SmpOutcome::Aborted);
        }
        self.state = SmpState::Expect1;
        self.question = None;
        OtrError::InvalidState(format!("unexpected {}", kind))
    }
}
