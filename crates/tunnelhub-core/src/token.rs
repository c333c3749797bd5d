//! Agent token: a protobuf-framed, AES-256-GCM-sealed, base32-encoded
//! capability handed to an agent so it can authenticate to the hub.
//!
//! Wire format mirrors the fork this was distilled from: a protobuf message
//! (`id`, `name`, `expire_at`, `scope_paths`) sealed with AES-GCM, nonce
//! prepended to the ciphertext, then base32 (RFC 4648, no padding).

use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use data_encoding::BASE32_NOPAD;
use prost::Message;
use ring::aead::{self, BoundKey, Nonce, NonceSequence, UnboundKey, AES_256_GCM};
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// An agent's identity and authorization, issued offline by a hub operator.
#[derive(Clone, PartialEq, Eq, Message)]
pub struct AgentToken {
	/// Identifier of the *token*, not of a particular agent process instance.
	#[prost(int64, tag = "1")]
	pub id: i64,
	/// Human label; auto-generated two-word petname when not supplied at
	/// registration time.
	#[prost(string, tag = "2")]
	pub name: String,
	/// Unix seconds; 0 means the token never expires.
	#[prost(int64, tag = "3")]
	pub expire_at: i64,
	/// Exact-match request paths this agent will service. Empty means no
	/// restriction.
	#[prost(string, repeated, tag = "4")]
	pub scope_paths: Vec<String>,
}

impl AgentToken {
	pub fn new(name: Option<String>, expire_at: i64, scope_paths: Vec<String>) -> Self {
		let name = name.unwrap_or_else(|| {
			petname::Petnames::default()
				.generate_one(2, "-")
				.unwrap_or_default()
		});
		AgentToken {
			id: rand::random::<i64>() & i64::MAX,
			name,
			expire_at,
			scope_paths,
		}
	}

	/// True when `expire_at` is non-zero and in the past.
	pub fn is_expired(&self) -> bool {
		if self.expire_at == 0 {
			return false;
		}
		let now = SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|d| d.as_secs() as i64)
			.unwrap_or(0);
		now >= self.expire_at
	}

	pub fn scope_set(&self) -> HashSet<&str> {
		self.scope_paths.iter().map(String::as_str).collect()
	}

	/// Whether an agent carrying this token may service a request for `path`.
	pub fn allows_path(&self, path: &str) -> bool {
		self.scope_paths.is_empty() || self.scope_paths.iter().any(|p| p == path)
	}
}

struct SingleNonce(Option<[u8; NONCE_LEN]>);

impl NonceSequence for SingleNonce {
	fn advance(&mut self) -> Result<Nonce, ring::error::Unspecified> {
		self.0.take().map(Nonce::assume_unique_for_key).ok_or(ring::error::Unspecified)
	}
}

/// Seals and opens [`AgentToken`]s under a single symmetric key.
///
/// Keys under 32 bytes are right-zero-padded; keys over 32 bytes are
/// truncated (with a warning). This is deliberately permissive, to keep
/// compatibility with whatever secret string an operator already issued
/// tokens under.
pub struct TokenManager {
	key: [u8; KEY_LEN],
	rng: SystemRandom,
}

impl TokenManager {
	pub fn new(secret: &[u8]) -> Self {
		let mut key = [0u8; KEY_LEN];
		if secret.len() >= KEY_LEN {
			if secret.len() > KEY_LEN {
				tracing::warn!("token secret is longer than 32 bytes, truncating");
			}
			key.copy_from_slice(&secret[..KEY_LEN]);
		} else {
			key[..secret.len()].copy_from_slice(secret);
		}
		TokenManager {
			key,
			rng: SystemRandom::new(),
		}
	}

	fn unbound_key(&self) -> UnboundKey {
		UnboundKey::new(&AES_256_GCM, &self.key).expect("32-byte key is valid for AES-256-GCM")
	}

	/// Encode, seal, and base32-encode a token.
	pub fn seal(&self, token: &AgentToken) -> Result<String, Error> {
		let plaintext = token.encode_to_vec();

		let mut nonce_bytes = [0u8; NONCE_LEN];
		self.rng
			.fill(&mut nonce_bytes)
			.map_err(|_| Error::InvalidToken)?;

		let mut sealing = aead::SealingKey::new(self.unbound_key(), SingleNonce(Some(nonce_bytes)));
		let mut in_out = plaintext;
		sealing
			.seal_in_place_append_tag(aead::Aad::empty(), &mut in_out)
			.map_err(|_| Error::InvalidToken)?;

		let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
		sealed.extend_from_slice(&nonce_bytes);
		sealed.extend_from_slice(&in_out);

		Ok(BASE32_NOPAD.encode(&sealed))
	}

	/// Reverse of [`Self::seal`]. Any decode or authentication failure
	/// collapses into [`Error::InvalidToken`]; expiry is checked separately
	/// by callers (see [`AgentToken::is_expired`]), not here.
	pub fn open(&self, encoded: &str) -> Result<AgentToken, Error> {
		let sealed = BASE32_NOPAD
			.decode(encoded.as_bytes())
			.map_err(|_| Error::InvalidToken)?;
		if sealed.len() < NONCE_LEN {
			return Err(Error::InvalidToken);
		}
		let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
		let mut nonce_arr = [0u8; NONCE_LEN];
		nonce_arr.copy_from_slice(nonce_bytes);

		let mut opening = aead::OpeningKey::new(self.unbound_key(), SingleNonce(Some(nonce_arr)));
		let mut in_out = ciphertext.to_vec();
		let plaintext = opening
			.open_in_place(aead::Aad::empty(), &mut in_out)
			.map_err(|_| Error::InvalidToken)?;

		AgentToken::decode(plaintext).map_err(|_| Error::InvalidToken)
	}
}
