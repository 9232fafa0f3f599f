//! Слоты ключей сессии
//!
//! Two slots for our DH key pairs and two for the peer's public values, plus a
//! 2×2 arena of symmetric sessions indexed by (our slot, their slot).
//!
//! ```text
//!                 theirs[CURRENT]     theirs[PREVIOUS]
//! ours[CURRENT]   session             session
//! ours[PREVIOUS]  session  ← send     session
//! ```
//!
//! We send with our previous (acknowledged) key and their current key,
//! announcing our current key as `next_dh`. A message addressed to our current
//! key means the peer has seen it, so our slots rotate; a message from their
//! current key carries their next key, so their slots rotate.

use crate::crypto::keys::DhKeyPair;
use crate::crypto::provider::{CryptoProvider, DhPublicKey, KEY_LEN};
use crate::utils::error::{OtrError, Result};
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const CURRENT: usize = 0;
pub const PREVIOUS: usize = 1;

const SEND_HIGH: u8 = 0x01;
const SEND_LOW: u8 = 0x02;

/// Symmetric keys and counters for one (our key, their key) pair.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionKeys {
    send_enc: [u8; KEY_LEN],
    send_mac: [u8; KEY_LEN],
    recv_enc: [u8; KEY_LEN],
    recv_mac: [u8; KEY_LEN],
    send_counter: u64,
    /// Highest counter accepted so far.
    recv_counter: u64,
    recv_mac_used: bool,
}

impl SessionKeys {
    fn derive<P: CryptoProvider>(ours: &DhKeyPair<P>, theirs: &DhPublicKey) -> Result<Self> {
        let shared = ours.agree(theirs)?;
        let (send_byte, recv_byte) = if ours.public_key() > theirs {
            (SEND_HIGH, SEND_LOW)
        } else {
            (SEND_LOW, SEND_HIGH)
        };

        let send_enc = derive_enc_key::<P>(&shared, send_byte)?;
        let recv_enc = derive_enc_key::<P>(&shared, recv_byte)?;
        Ok(Self {
            send_mac: P::hash(&send_enc),
            recv_mac: P::hash(&recv_enc),
            send_enc,
            recv_enc,
            send_counter: 0,
            recv_counter: 0,
            recv_mac_used: false,
        })
    }

    pub fn send_enc(&self) -> &[u8; KEY_LEN] {
        &self.send_enc
    }

    pub fn send_mac(&self) -> &[u8; KEY_LEN] {
        &self.send_mac
    }

    pub fn recv_enc(&self) -> &[u8; KEY_LEN] {
        &self.recv_enc
    }

    pub fn recv_mac(&self) -> &[u8; KEY_LEN] {
        &self.recv_mac
    }

    pub fn recv_counter(&self) -> u64 {
        self.recv_counter
    }

    /// Reserve the next outgoing counter.
    pub fn next_send_counter(&mut self) -> Result<u64> {
        self.send_counter = self
            .send_counter
            .checked_add(1)
            .ok_or_else(|| OtrError::InvalidState("send counter exhausted".to_string()))?;
        Ok(self.send_counter)
    }

    fn mark_received(&mut self, counter: u64) {
        self.recv_counter = counter;
        self.recv_mac_used = true;
    }
}

fn derive_enc_key<P: CryptoProvider>(shared: &[u8], direction: u8) -> Result<[u8; KEY_LEN]> {
    let mut info = [0u8; 4];
    info[0] = direction;
    info[1..].copy_from_slice(b"enc");
    let okm = P::hkdf_derive_key(&[], shared, &info, KEY_LEN)?;
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&okm);
    Ok(key)
}

struct OurSlot<P: CryptoProvider> {
    keyid: u32,
    pair: DhKeyPair<P>,
}

#[derive(Clone, Copy)]
struct TheirSlot {
    keyid: u32,
    public: DhPublicKey,
}

/// Current/previous key slots and the derived session arena.
pub struct SessionKeyManager<P: CryptoProvider> {
    ours: [Option<OurSlot<P>>; 2],
    theirs: [Option<TheirSlot>; 2],
    sessions: [[Option<SessionKeys>; 2]; 2],
    /// Receiving MAC keys of retired sessions, waiting to be published.
    pending_disclosure: Vec<[u8; KEY_LEN]>,
}

impl<P: CryptoProvider> SessionKeyManager<P> {
    /// Seed the slots from a finished AKE. The AKE key becomes our previous
    /// key and a fresh key pair becomes our current one.
    pub fn new(
        our_keyid: u32,
        our_dh: DhKeyPair<P>,
        their_keyid: u32,
        their_dh: DhPublicKey,
    ) -> Result<Self> {
        use tracing::debug;

        let next_keyid = next_id(our_keyid)?;
        let mut manager = Self {
            ours: [
                Some(OurSlot {
                    keyid: next_keyid,
                    pair: DhKeyPair::generate()?,
                }),
                Some(OurSlot {
                    keyid: our_keyid,
                    pair: our_dh,
                }),
            ],
            theirs: [
                Some(TheirSlot {
                    keyid: their_keyid,
                    public: their_dh,
                }),
                None,
            ],
            sessions: [[None, None], [None, None]],
            pending_disclosure: Vec::new(),
        };
        manager.derive_missing()?;

        debug!(
            target: "otr::keys",
            our_keyid = our_keyid,
            their_keyid = their_keyid,
            "Session key slots initialized"
        );
        Ok(manager)
    }

    /// (sender keyid, recipient keyid) for the next outgoing message.
    pub fn sending_key_ids(&self) -> Result<(u32, u32)> {
        let ours = self.our_slot(PREVIOUS)?;
        let theirs = self.their_slot(CURRENT)?;
        Ok((ours.keyid, theirs.keyid))
    }

    /// Our newest public value, announced as `next_dh`.
    pub fn next_dh(&self) -> Result<DhPublicKey> {
        Ok(*self.our_slot(CURRENT)?.pair.public_key())
    }

    pub fn sending_session_mut(&mut self) -> Result<&mut SessionKeys> {
        self.sessions[PREVIOUS][CURRENT]
            .as_mut()
            .ok_or_else(|| OtrError::InvalidState("no sending session".to_string()))
    }

    /// Arena coordinates for an incoming message's key ids.
    pub fn locate(&self, recipient_keyid: u32, sender_keyid: u32) -> Option<(usize, usize)> {
        let our = self
            .ours
            .iter()
            .position(|slot| slot.as_ref().map(|s| s.keyid) == Some(recipient_keyid))?;
        let their = self
            .theirs
            .iter()
            .position(|slot| slot.as_ref().map(|s| s.keyid) == Some(sender_keyid))?;
        self.sessions[our][their].as_ref().map(|_| (our, their))
    }

    pub fn session(&self, our: usize, their: usize) -> Option<&SessionKeys> {
        self.sessions[our][their].as_ref()
    }

    /// Whether a message from `sender_keyid` announces the peer's next key.
    pub fn advances_theirs(&self, sender_keyid: u32) -> bool {
        self.theirs[CURRENT].map(|s| s.keyid) == Some(sender_keyid)
    }

    /// Record an authenticated message and rotate whichever side advanced.
    ///
    /// Everything fallible (fresh key pair, new sessions) is prepared before
    /// any slot changes, so an error leaves the manager as it was.
    pub fn accept(
        &mut self,
        our: usize,
        their: usize,
        counter: u64,
        sender_keyid: u32,
        next_dh: &DhPublicKey,
    ) -> Result<()> {
        use tracing::debug;

        let fresh_ours = if our == CURRENT {
            Some(OurSlot {
                keyid: next_id(self.our_slot(CURRENT)?.keyid)?,
                pair: DhKeyPair::generate()?,
            })
        } else {
            None
        };
        let fresh_theirs = if self.advances_theirs(sender_keyid)
            && self.theirs[CURRENT].map(|s| s.public) != Some(*next_dh)
        {
            P::validate_dh_public(next_dh)?;
            Some(TheirSlot {
                keyid: next_id(self.their_slot(CURRENT)?.keyid)?,
                public: *next_dh,
            })
        } else {
            None
        };

        // Слоты после ротации; новые ячейки арены считаем заранее
        let next_ours: [Option<&DhKeyPair<P>>; 2] = match &fresh_ours {
            Some(fresh) => [Some(&fresh.pair), self.ours[CURRENT].as_ref().map(|s| &s.pair)],
            None => [
                self.ours[CURRENT].as_ref().map(|s| &s.pair),
                self.ours[PREVIOUS].as_ref().map(|s| &s.pair),
            ],
        };
        let next_theirs: [Option<DhPublicKey>; 2] = match &fresh_theirs {
            Some(fresh) => [Some(fresh.public), self.theirs[CURRENT].map(|s| s.public)],
            None => [
                self.theirs[CURRENT].map(|s| s.public),
                self.theirs[PREVIOUS].map(|s| s.public),
            ],
        };
        let mut staged: [[Option<SessionKeys>; 2]; 2] = [[None, None], [None, None]];
        for o in [CURRENT, PREVIOUS] {
            for t in [CURRENT, PREVIOUS] {
                let is_new = (o == CURRENT && fresh_ours.is_some()) || (t == CURRENT && fresh_theirs.is_some());
                if !is_new {
                    continue;
                }
                if let (Some(pair), Some(public)) = (next_ours[o], next_theirs[t]) {
                    staged[o][t] = Some(SessionKeys::derive(pair, &public)?);
                }
            }
        }

        // Дальше ничего не падает
        if let Some(session) = self.sessions[our][their].as_mut() {
            session.mark_received(counter);
        }
        if let Some(fresh) = fresh_ours {
            debug!(target: "otr::keys", new_keyid = fresh.keyid, "Rotated our DH key");
            self.commit_ours(fresh);
        }
        if let Some(fresh) = fresh_theirs {
            debug!(target: "otr::keys", new_keyid = fresh.keyid, "Rotated peer DH key");
            self.commit_theirs(fresh);
        }
        for (o, row) in staged.into_iter().enumerate() {
            for (t, session) in row.into_iter().enumerate() {
                if session.is_some() {
                    self.sessions[o][t] = session;
                }
            }
        }
        Ok(())
    }

    /// Drain MAC keys ready for publication.
    pub fn take_disclosures(&mut self) -> Vec<[u8; KEY_LEN]> {
        std::mem::take(&mut self.pending_disclosure)
    }

    pub fn our_keyid(&self, slot: usize) -> Option<u32> {
        self.ours[slot].as_ref().map(|s| s.keyid)
    }

    pub fn their_keyid(&self, slot: usize) -> Option<u32> {
        self.theirs[slot].map(|s| s.keyid)
    }

    fn our_slot(&self, slot: usize) -> Result<&OurSlot<P>> {
        self.ours[slot]
            .as_ref()
            .ok_or_else(|| OtrError::InvalidState("missing local key slot".to_string()))
    }

    fn their_slot(&self, slot: usize) -> Result<TheirSlot> {
        self.theirs[slot]
            .ok_or_else(|| OtrError::InvalidState("missing peer key slot".to_string()))
    }

    fn commit_ours(&mut self, fresh: OurSlot<P>) {
        for their in [CURRENT, PREVIOUS] {
            self.retire(PREVIOUS, their);
        }
        self.sessions[PREVIOUS] = [
            self.sessions[CURRENT][CURRENT].take(),
            self.sessions[CURRENT][PREVIOUS].take(),
        ];
        self.ours[PREVIOUS] = self.ours[CURRENT].take();
        self.ours[CURRENT] = Some(fresh);
    }

    fn commit_theirs(&mut self, fresh: TheirSlot) {
        for our in [CURRENT, PREVIOUS] {
            self.retire(our, PREVIOUS);
            self.sessions[our][PREVIOUS] = self.sessions[our][CURRENT].take();
        }
        self.theirs[PREVIOUS] = self.theirs[CURRENT];
        self.theirs[CURRENT] = Some(fresh);
    }

    /// Drop a session, queueing its receiving MAC key if it was ever used.
    fn retire(&mut self, our: usize, their: usize) {
        if let Some(session) = self.sessions[our][their].take() {
            if session.recv_mac_used {
                self.pending_disclosure.push(session.recv_mac);
            }
        }
    }

    /// Derive every arena cell whose two slots are filled.
    fn derive_missing(&mut self) -> Result<()> {
        for our in [CURRENT, PREVIOUS] {
            for their in [CURRENT, PREVIOUS] {
                if self.sessions[our][their].is_some() {
                    continue;
                }
                if let (Some(ours), Some(theirs)) = (&self.ours[our], &self.theirs[their]) {
                    self.sessions[our][their] = Some(SessionKeys::derive(&ours.pair, &theirs.public)?);
                }
            }
        }
        Ok(())
    }
}

fn next_id(keyid: u32) -> Result<u32> {
    keyid
        .checked_add(1)
        .ok_or_else(|| OtrError::InvalidState("key id space exhausted".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::suites::classic::ClassicSuiteProvider;

    type P = ClassicSuiteProvider;

    fn pair() -> (SessionKeyManager<P>, SessionKeyManager<P>) {
        let a = DhKeyPair::<P>::generate().unwrap();
        let b = DhKeyPair::<P>::generate().unwrap();
        let a_pub = *a.public_key();
        let b_pub = *b.public_key();
        (
            SessionKeyManager::new(1, a, 1, b_pub).unwrap(),
            SessionKeyManager::new(1, b, 1, a_pub).unwrap(),
        )
    }

    #[test]
    fn test_initial_slots() {
        let (alice, _) = pair();
        assert_eq!(alice.sending_key_ids().unwrap(), (1, 1));
        assert_eq!(alice.our_keyid(CURRENT), Some(2));
        assert_eq!(alice.their_keyid(PREVIOUS), None);
    }

    #[test]
    fn test_directional_keys_mirror() {
        let (alice, bob) = pair();
        let (a_our, a_their) = (PREVIOUS, CURRENT);
        let (b_our, b_their) = bob.locate(1, 1).unwrap();
        let a = alice.session(a_our, a_their).unwrap();
        let b = bob.session(b_our, b_their).unwrap();
        assert_eq!(a.send_enc(), b.recv_enc());
        assert_eq!(a.send_mac(), b.recv_mac());
        assert_eq!(a.recv_enc(), b.send_enc());
        assert_ne!(a.send_enc(), a.recv_enc());
    }

    #[test]
    fn test_peer_advance_rotates_theirs() {
        let (alice, mut bob) = pair();
        let next = alice.next_dh().unwrap();
        let (our, their) = bob.locate(1, 1).unwrap();
        bob.accept(our, their, 1, 1, &next).unwrap();
        assert_eq!(bob.their_keyid(CURRENT), Some(2));
        assert_eq!(bob.their_keyid(PREVIOUS), Some(1));
        assert_eq!(bob.sending_key_ids().unwrap(), (1, 2));
    }

    #[test]
    fn test_failed_accept_keeps_slots() {
        let (_, mut bob) = pair();
        let mut low_order = [0xffu8; 32];
        low_order[0] = 0xec;
        low_order[31] = 0x7f;

        // Acknowledges our current key and announces a bad next key at once.
        let (our, their) = bob.locate(2, 1).unwrap();
        assert!(bob.accept(our, their, 1, 1, &low_order).is_err());
        assert_eq!(bob.our_keyid(CURRENT), Some(2));
        assert_eq!(bob.their_keyid(CURRENT), Some(1));
        assert_eq!(bob.session(our, their).unwrap().recv_counter(), 0);
        assert!(bob.sending_session_mut().is_ok());
    }

    #[test]
    fn test_acknowledged_key_rotates_ours_and_discloses() {
        let (_, mut bob) = pair();
        let (our, their) = bob.locate(1, 1).unwrap();
        let unchanged = *bob.session(our, their).map(|s| s.recv_mac()).unwrap();
        // Mark the previous-row session as used, then acknowledge our current key twice.
        bob.accept(our, their, 1, 5, &[9u8; 32]).unwrap();
        assert!(bob.take_disclosures().is_empty());

        let (our, their) = bob.locate(2, 1).unwrap();
        assert_eq!(our, CURRENT);
        bob.accept(our, their, 1, 5, &[9u8; 32]).unwrap();
        assert_eq!(bob.our_keyid(PREVIOUS), Some(2));
        assert_eq!(bob.our_keyid(CURRENT), Some(3));

        let disclosed = bob.take_disclosures();
        assert_eq!(disclosed, vec![unchanged]);
        assert!(bob.locate(1, 1).is_none());
    }
}
