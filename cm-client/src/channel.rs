use crate::error::{Result, SessionError};
use cm_proto::{crypto, ChannelCipher, CmFrameCodec, EResult, Message, Payload, ProtocolError};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{timeout, Duration};
use tokio_util::codec::Framed;
use tracing::{debug, info};

/// Runs the channel encryption handshake and installs the cipher on success.
///
/// The server opens with a nonce; we answer with our own nonce and the
/// pre-shared-key signature over both, then wait for its verdict.
pub async fn establish<S>(
    framed: &mut Framed<S, CmFrameCodec>,
    psk: &[u8],
    read_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    info!("Setting up channel encryption");

    let request = read_message(framed, read_timeout).await?;
    let server_nonce = match request.payload {
        Payload::ChannelEncryptRequest(body) => body.server_nonce,
        other => {
            return Err(ProtocolError::ChannelHandshake(format!(
                "expected encrypt request, got kind {}",
                other.kind_code()
            ))
            .into())
        }
    };
    debug!("Received server nonce: {}", server_nonce);

    let client_nonce = crypto::generate_nonce();
    let sig = crypto::compute_channel_signature(psk, &server_nonce, &client_nonce);
    framed
        .send(Message::channel_encrypt_response(client_nonce.clone(), sig))
        .await?;
    debug!("Sent encrypt response");

    let verdict = read_message(framed, read_timeout).await?;
    match verdict.payload {
        Payload::ChannelEncryptResult(body) if body.result == EResult::Ok => {}
        Payload::ChannelEncryptResult(body) => {
            info!("Server rejected channel: {}", body.result);
            return Err(SessionError::backend(body.result));
        }
        other => {
            return Err(ProtocolError::ChannelHandshake(format!(
                "expected encrypt result, got kind {}",
                other.kind_code()
            ))
            .into())
        }
    }

    let key = crypto::derive_channel_key(psk, &server_nonce, &client_nonce);
    framed.codec_mut().set_cipher(ChannelCipher::new(key));

    info!("Channel encrypted");
    Ok(())
}

async fn read_message<S>(
    framed: &mut Framed<S, CmFrameCodec>,
    read_timeout: Duration,
) -> Result<Message>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match timeout(read_timeout, framed.next()).await {
        Ok(Some(message)) => Ok(message?),
        Ok(None) => Err(SessionError::ConnectionClosed),
        Err(_) => Err(SessionError::Timeout("channel handshake")),
    }
}
