/// Client validation and the PostgreSQL authentication exchanges.
///
/// Two exchanges live here: the seed-time exchange that authenticates the
/// proxy's own pool connections against a backend, and the client exchange
/// that is proxied through to the primary so the proxy never needs to know
/// how the cluster verifies passwords.
use std::collections::HashMap;

use crate::config::Credentials;
use crate::core::connect::{self, ProxyStream};
use crate::core::tls::StreamUpgrader;
use crate::core::Node;
use crate::error::{ProxyError, ProxyResult};
use crate::protocol;

/// Parse the parameter section of a startup frame into key/value pairs.
fn startup_parameters(message: &[u8]) -> HashMap<String, String> {
    let mut parameters = HashMap::new();

    // length(4) + version(4), then NUL-terminated key/value strings,
    // terminated by an empty key
    if message.len() <= 8 {
        return parameters;
    }

    let mut fields = message[8..].split(|b| *b == 0);
    while let (Some(key), Some(value)) = (fields.next(), fields.next()) {
        if key.is_empty() {
            break;
        }
        parameters.insert(
            String::from_utf8_lossy(key).to_string(),
            String::from_utf8_lossy(value).to_string(),
        );
    }

    parameters
}

/// Check that the client's claimed user and database match what the proxy
/// itself connects with.
pub fn validate_client(startup: &[u8], credentials: &Credentials) -> bool {
    let parameters = startup_parameters(startup);

    parameters.get("user").map(String::as_str) == Some(credentials.username.as_str())
        && parameters.get("database").map(String::as_str) == Some(credentials.database.as_str())
}

/// Authenticate a client by proxying the authentication exchange through to
/// the primary node: forward the startup frame, relay the backend's
/// challenge to the client, relay the client's response back, and relay the
/// verdict. The temporary backend connection is closed on return.
///
/// Transport errors surface before the verdict is interpreted; a partially
/// failed exchange never reports success.
pub async fn authenticate_client(
    client: &mut ProxyStream,
    startup: &[u8],
    primary: &Node,
    credentials: &Credentials,
    upgrader: &dyn StreamUpgrader,
) -> ProxyResult<bool> {
    let mut backend = connect::connect(&primary.host_port, &credentials.ssl, upgrader).await?;

    connect::send(&mut backend, startup).await?;
    let challenge = connect::receive(&mut backend).await?;
    connect::send(client, &challenge).await?;

    // trust-style setups answer the startup frame with AuthenticationOk
    // directly, no client response required
    if protocol::is_authentication_ok(&challenge) {
        return Ok(true);
    }

    let response = connect::receive(client).await?;
    connect::send(&mut backend, &response).await?;

    let verdict = connect::receive(&mut backend).await?;
    connect::send(client, &verdict).await?;

    Ok(protocol::is_authentication_ok(&verdict))
}

/// Answer a backend authentication challenge when seeding pool connections.
/// Supports AuthenticationOk (trust), cleartext and MD5 password requests.
pub async fn handle_authentication_request(
    connection: &mut ProxyStream,
    message: &[u8],
    credentials: &Credentials,
) -> ProxyResult<bool> {
    if protocol::get_message_type(message) != protocol::AUTHENTICATION_MESSAGE_TYPE {
        return Err(ProxyError::protocol(format!(
            "expected authentication request, got message type {:?}",
            protocol::get_message_type(message) as char
        )));
    }

    match protocol::get_authentication_type(message) {
        protocol::AUTHENTICATION_OK => Ok(true),
        protocol::AUTHENTICATION_CLEARTEXT_PASSWORD => {
            let password = protocol::create_password_message(&credentials.password);
            connect::send(connection, &password).await?;
            let response = connect::receive(connection).await?;
            Ok(protocol::is_authentication_ok(&response))
        }
        protocol::AUTHENTICATION_MD5_PASSWORD => {
            let salt = message.get(9..13).ok_or_else(|| {
                ProxyError::protocol("MD5 authentication request missing salt")
            })?;
            let hashed = md5_password(&credentials.username, &credentials.password, salt);
            let password = protocol::create_password_message(&hashed);
            connect::send(connection, &password).await?;
            let response = connect::receive(connection).await?;
            Ok(protocol::is_authentication_ok(&response))
        }
        other => Err(ProxyError::auth(format!(
            "unsupported authentication method: {}",
            other
        ))),
    }
}

/// PostgreSQL MD5 password scheme:
/// `"md5" + hex(md5(hex(md5(password + username)) + salt))`.
fn md5_password(username: &str, password: &str, salt: &[u8]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, username)));

    let mut salted = inner.into_bytes();
    salted.extend_from_slice(salt);

    format!("md5{:x}", md5::compute(&salted))
}
