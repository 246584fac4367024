// MIT License
//
// Copyright (c) 2019-2021 Tobias Pfeiffer
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

//! Authentication conversations run on every new pooled connection before it is handed out.
//!
//! see https://github.com/mongodb/specifications/blob/master/source/auth/auth.rst

use {
	crate::{*, common::{AuthMech, Credential}, connection::Connection, error::AuthError, wire::HandshakeReply},
	async_trait::async_trait,
	bson::{doc, Binary, Document, spec::BinarySubtype},
	tracing::debug
};

const EXTERNAL_SOURCE: &str = "$external";

/// Runs one authentication conversation over a freshly opened connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
	fn mechanism(&self) -> AuthMech;

	async fn authenticate(&self, conn: &mut Connection, credential: &Credential) -> Result<()>;
}

/// Picks the authenticator for `credential`. Without an explicit mechanism SCRAM-SHA-256 is
/// preferred if the server lists it for the user, SCRAM-SHA-1 is the fallback.
pub fn authenticator(credential: &Credential, handshake: &HandshakeReply) -> Result<Box<dyn Authenticator>> {
	let mechanism = match credential.mechanism {
		Some(mechanism) => mechanism,
		None => match &handshake.sasl_supported_mechs {
			Some(mechs) if mechs.iter().any(|m| m == AuthMech::ScramSha256.as_str()) => AuthMech::ScramSha256,
			_ => AuthMech::ScramSha1
		}
	};

	let authenticator: Box<dyn Authenticator> = match mechanism {
		AuthMech::MongoDbX509 => Box::new(X509),
		AuthMech::Plain       => Box::new(Plain),
		#[cfg(feature = "auth")]
		AuthMech::ScramSha1   => Box::new(scram::Scram(scram::ScramVersion::Sha1)),
		#[cfg(feature = "auth")]
		AuthMech::ScramSha256 => Box::new(scram::Scram(scram::ScramVersion::Sha256)),
		#[cfg(not(feature = "auth"))]
		mechanism             => return Err(AuthError::UnsupportedMechanism(mechanism.as_str().to_string()).into())
	};
	Ok(authenticator)
}

/// Selects the mechanism and authenticates.
pub async fn authenticate(conn: &mut Connection, credential: &Credential, handshake: &HandshakeReply) -> Result<()> {
	let authenticator = authenticator(credential, handshake)?;
	debug!(connection = conn.id, user = %credential.username, mechanism = authenticator.mechanism().as_str(), "authenticating");
	authenticator.authenticate(conn, credential).await
}

fn binary(bytes: Vec<u8>) -> Binary {
	Binary { subtype: BinarySubtype::Generic, bytes }
}

/// Runs a SASL command, turning server rejections into authentication errors.
async fn sasl_command(conn: &mut Connection, db: &str, command: Document) -> Result<Document> {
	conn.run_command(db, command).await.map_err(|e| match e {
		Error::Command(e) => AuthError::ServerError(e.message).into(),
		e => e
	})
}

fn sasl_payload(reply: &Document) -> Result<&[u8]> {
	reply.get_binary_generic("payload")
		.map(Vec::as_slice)
		.map_err(|_| AuthError::InvalidReply.into())
}

struct X509;

#[async_trait]
impl Authenticator for X509 {
	fn mechanism(&self) -> AuthMech {
		AuthMech::MongoDbX509
	}

	async fn authenticate(&self, conn: &mut Connection, credential: &Credential) -> Result<()> {
		let mut command = doc! { "authenticate": 1, "mechanism": AuthMech::MongoDbX509.as_str() };
		if !credential.username.is_empty() {
			command.insert("user", credential.username.as_str());
		}
		sasl_command(conn, EXTERNAL_SOURCE, command).await?;
		Ok(())
	}
}

struct Plain;

#[async_trait]
impl Authenticator for Plain {
	fn mechanism(&self) -> AuthMech {
		AuthMech::Plain
	}

	async fn authenticate(&self, conn: &mut Connection, credential: &Credential) -> Result<()> {
		let password = credential.password.as_deref().ok_or(AuthError::InvalidOptions)?;
		let source = match credential.source.as_str() {
			"" | "admin" => EXTERNAL_SOURCE,
			source       => source
		};

		let reply = sasl_command(conn, source, doc! {
			"saslStart":     1,
			"mechanism":     AuthMech::Plain.as_str(),
			"payload":       binary(format!("\0{}\0{}", credential.username, password).into_bytes()),
			"autoAuthorize": 1
		}).await?;

		match reply.get_bool("done") {
			Ok(true) => Ok(()),
			_ => Err(AuthError::InvalidReply.into())
		}
	}
}

#[cfg(feature = "auth")]
pub(crate) mod scram {
	use {
		super::*,
		base64::{Engine as _, engine::general_purpose::STANDARD as BASE64},
		hmac::{Hmac, Mac},
		rand::Rng,
		sha1::Sha1,
		sha2::{Digest, Sha256}
	};

	pub const MIN_ITERATIONS: u32 = 4096;

	#[derive(Debug, Copy, Clone, Eq, PartialEq)]
	pub enum ScramVersion {
		Sha1,
		Sha256
	}

	impl ScramVersion {
		pub fn mechanism(self) -> AuthMech {
			match self {
				Self::Sha1   => AuthMech::ScramSha1,
				Self::Sha256 => AuthMech::ScramSha256
			}
		}

		/// SCRAM-SHA-1 hashes `user:mongo:password` with MD5 first, SCRAM-SHA-256 uses the password as is.
		pub fn prepare_password(self, username: &str, password: &str) -> String {
			match self {
				Self::Sha1   => format!("{:x}", md5::compute(format!("{}:mongo:{}", username, password))),
				Self::Sha256 => password.to_string()
			}
		}

		pub fn hmac(self, key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
			Ok(match self {
				Self::Sha1 => {
					let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(|_| AuthError::InvalidReply)?;
					mac.update(data);
					mac.finalize().into_bytes().to_vec()
				}
				Self::Sha256 => {
					let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| AuthError::InvalidReply)?;
					mac.update(data);
					mac.finalize().into_bytes().to_vec()
				}
			})
		}

		pub fn hash(self, data: &[u8]) -> Vec<u8> {
			match self {
				Self::Sha1   => Sha1::digest(data).to_vec(),
				Self::Sha256 => Sha256::digest(data).to_vec()
			}
		}

		/// PBKDF2 with the matching HMAC, `Hi` in RFC 5802.
		pub fn hi(self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>> {
			let result = match self {
				Self::Sha1 => {
					let mut out = vec![0u8; 20];
					pbkdf2::pbkdf2::<Hmac<Sha1>>(password, salt, iterations, &mut out).map(|_| out)
				}
				Self::Sha256 => {
					let mut out = vec![0u8; 32];
					pbkdf2::pbkdf2::<Hmac<Sha256>>(password, salt, iterations, &mut out).map(|_| out)
				}
			};
			result.map_err(|_| AuthError::InvalidReply.into())
		}
	}

	/// Client side of one SCRAM exchange.
	pub struct ScramConversation {
		version:           ScramVersion,
		password:          String,
		client_nonce:      String,
		client_first_bare: String,
		server_signature:  Option<Vec<u8>>
	}

	impl ScramConversation {
		/// `password` must already be prepared with `ScramVersion::prepare_password`.
		pub fn new(version: ScramVersion, username: &str, password: String, client_nonce: String) -> Self {
			let username = username.replace('=', "=3D").replace(',', "=2C");
			Self {
				version,
				password,
				client_first_bare: format!("n={},r={}", username, client_nonce),
				client_nonce,
				server_signature:  None
			}
		}

		pub fn client_first(&self) -> String {
			format!("n,,{}", self.client_first_bare)
		}

		/// Consumes `server-first-message`, producing `client-final-message`.
		pub fn client_final(&mut self, server_first: &str) -> Result<String> {
			let nonce = attribute(server_first, 'r').ok_or(AuthError::InvalidReply)?;
			let salt = attribute(server_first, 's')
				.and_then(|s| BASE64.decode(s).ok())
				.ok_or(AuthError::InvalidReply)?;
			let iterations = attribute(server_first, 'i')
				.and_then(|i| i.parse::<u32>().ok())
				.ok_or(AuthError::InvalidReply)?;

			if iterations < MIN_ITERATIONS {
				return Err(AuthError::InvalidIterationCount(iterations).into());
			}
			if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
				return Err(AuthError::InvalidServerNonce.into());
			}

			let without_proof = format!("c=biws,r={}", nonce);
			let auth_message = format!("{},{},{}", self.client_first_bare, server_first, without_proof);

			let v = self.version;
			let salted_password  = v.hi(self.password.as_bytes(), &salt, iterations)?;
			let client_key       = v.hmac(&salted_password, b"Client Key")?;
			let stored_key       = v.hash(&client_key);
			let client_signature = v.hmac(&stored_key, auth_message.as_bytes())?;
			let server_key       = v.hmac(&salted_password, b"Server Key")?;

			let proof = client_key.iter()
				.zip(&client_signature)
				.map(|(k, s)| k ^ s)
				.collect::<Vec<_>>();

			self.server_signature = Some(v.hmac(&server_key, auth_message.as_bytes())?);
			Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
		}

		/// Verifies `server-final-message`.
		pub fn verify(&self, server_final: &str) -> Result<()> {
			if let Some(e) = attribute(server_final, 'e') {
				return Err(AuthError::ServerError(e.to_string()).into());
			}

			let verifier = attribute(server_final, 'v')
				.and_then(|v| BASE64.decode(v).ok())
				.ok_or(AuthError::InvalidReply)?;

			match &self.server_signature {
				Some(signature) if *signature == verifier => Ok(()),
				_ => Err(AuthError::InvalidServerSignature.into())
			}
		}
	}

	fn attribute(message: &str, key: char) -> Option<&str> {
		message.split(',')
			.find_map(|part| part.strip_prefix(key)?.strip_prefix('='))
	}

	fn client_nonce() -> String {
		BASE64.encode(rand::thread_rng().gen::<[u8; 24]>())
	}

	pub struct Scram(pub ScramVersion);

	#[async_trait]
	impl Authenticator for Scram {
		fn mechanism(&self) -> AuthMech {
			self.0.mechanism()
		}

		async fn authenticate(&self, conn: &mut Connection, credential: &Credential) -> Result<()> {
			let password = credential.password.as_deref().ok_or(AuthError::InvalidOptions)?;
			let mut conversation = ScramConversation::new(
				self.0,
				&credential.username,
				self.0.prepare_password(&credential.username, password),
				client_nonce()
			);
			let source = credential.source.as_str();

			let reply = sasl_command(conn, source, doc! {
				"saslStart":     1,
				"mechanism":     self.mechanism().as_str(),
				"payload":       binary(conversation.client_first().into_bytes()),
				"autoAuthorize": 1,
				"options":       { "skipEmptyExchange": true }
			}).await?;

			let conversation_id = reply.get("conversationId").cloned().ok_or(AuthError::InvalidReply)?;
			let server_first = std::str::from_utf8(sasl_payload(&reply)?).map_err(|_| AuthError::InvalidReply)?;
			let client_final = conversation.client_final(server_first)?;

			let mut reply = sasl_command(conn, source, doc! {
				"saslContinue":   1,
				"conversationId": conversation_id.clone(),
				"payload":        binary(client_final.into_bytes())
			}).await?;

			let server_final = std::str::from_utf8(sasl_payload(&reply)?).map_err(|_| AuthError::InvalidReply)?;
			conversation.verify(server_final)?;

			// servers ignoring skipEmptyExchange want one more round
			while !reply.get_bool("done").unwrap_or(false) {
				reply = sasl_command(conn, source, doc! {
					"saslContinue":   1,
					"conversationId": conversation_id.clone(),
					"payload":        binary(Vec::new())
				}).await?;
			}

			Ok(())
		}
	}

	#[cfg(test)]
	mod tests {
		use super::*;

		#[test]
		fn rfc5802_sha1_vector() {
			let mut conversation = ScramConversation::new(
				ScramVersion::Sha1, "user", "pencil".to_string(), "fyko+d2lbbFgONRv9qkxdawL".to_string());
			assert_eq!(conversation.client_first(), "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");

			let client_final = conversation
				.client_final("r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
				.unwrap();
			assert_eq!(client_final, "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts=");
			conversation.verify("v=rmF9pqV8S7suAoZWja4dJRkFsKQ=").unwrap();
		}

		#[test]
		fn rfc7677_sha256_vector() {
			let mut conversation = ScramConversation::new(
				ScramVersion::Sha256, "user", "pencil".to_string(), "rOprNGfwEbeRWgbNEkqO".to_string());

			let client_final = conversation
				.client_final("r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096")
				.unwrap();
			assert_eq!(client_final, "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ=");
			conversation.verify("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=").unwrap();
		}

		#[test]
		fn rejects_bad_server_messages() {
			let new = || ScramConversation::new(ScramVersion::Sha256, "user", "pencil".to_string(), "abc".to_string());

			assert!(matches!(
				new().client_final("r=abcdef,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=1000"),
				Err(Error::Authentication(AuthError::InvalidIterationCount(1000)))
			));
			assert!(matches!(
				new().client_final("r=xyzdef,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096"),
				Err(Error::Authentication(AuthError::InvalidServerNonce))
			));
			assert!(matches!(
				new().client_final("r=abcdef,i=4096"),
				Err(Error::Authentication(AuthError::InvalidReply))
			));

			let mut conversation = new();
			conversation.client_final("r=abcdef,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096").unwrap();
			assert!(matches!(
				conversation.verify("v=AAAA"),
				Err(Error::Authentication(AuthError::InvalidServerSignature))
			));
			assert!(matches!(
				conversation.verify("e=invalid-proof"),
				Err(Error::Authentication(AuthError::ServerError(_)))
			));
		}

		#[test]
		fn usernames_are_escaped() {
			let conversation = ScramConversation::new(ScramVersion::Sha256, "a=b,c", String::new(), "n".to_string());
			assert_eq!(conversation.client_first(), "n,,n=a=3Db=2Cc,r=n");
		}

		#[test]
		fn sha1_password_is_md5_digested() {
			let prepared = ScramVersion::Sha1.prepare_password("user", "pencil");
			assert_eq!(prepared.len(), 32);
			assert!(prepared.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
			assert_eq!(ScramVersion::Sha256.prepare_password("user", "pencil"), "pencil");
		}
	}
}
