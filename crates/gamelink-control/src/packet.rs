//! Length-prefixed control-channel framing.
//!
//! Every control message is `{type: u16 LE, length: u16 LE, payload}`. Reads
//! are fully buffered: a frame whose declared length exceeds what has arrived
//! blocks until the rest shows up, and a socket that closes mid-frame is a
//! hard error, never a silently short payload.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ControlError;

// Frame type codes.
pub const PTYPE_HELLO: u16 = 0x1204;
pub const PTYPE_CONFIG: u16 = 0x1205;
pub const PTYPE_KEEPALIVE: u16 = 0x13ff;
pub const PTYPE_HEARTBEAT: u16 = 0x1401;
pub const PTYPE_RESYNC: u16 = 0x1404;
/// Post-handshake probe the host expects before it starts streaming.
pub const PTYPE_PROBE: u16 = 0x1405;
pub const PTYPE_JITTER: u16 = 0x140c;

pub const HELLO_PAYLOAD: [u8; 4] = [0x00, 0x05, 0x00, 0x00];

/// Opaque host configuration table, replayed bit-exactly. The field meanings
/// are undocumented; the only safe transformation is none at all.
pub const CONFIG_TABLE: [u32; 92] = [
    720, 266758, 1, 266762, 30, 70151, 68291329, 1280, 68291584, 1280, 68291840, 15360, 68292096,
    25600, 68292352, 2048, 68292608, 1024, 68289024, 262144, 17957632, 302055424, 134217729,
    16777490, 70153, 68293120, 768000, 17961216, 303235072, 335609857, 838861842, 352321536,
    1006634002, 369098752, 335545362, 385875968, 1042, 402653184, 134218770, 419430400, 167773202,
    436207616, 855638290, 266779, 7000, 266780, 2000, 266781, 50, 266782, 3000, 266783, 2, 266794,
    5000, 266795, 500, 266784, 75, 266785, 25, 266786, 10, 266787, 60, 266788, 30, 266789, 3,
    266790, 1000, 266791, 5000, 266792, 5000, 266793, 5000, 70190, 68301063, 10240, 68301312,
    6400, 68301568, 768000, 68299776, 768, 68300032, 2560, 68300544, 0, 34746368, 0xFE000000,
];

/// The CONFIG frame as sent on the wire: the u32 table, a u16 0x0013, and one
/// trailing zero byte.
pub fn config_payload() -> Vec<u8> {
    let mut payload = Vec::with_capacity(CONFIG_TABLE.len() * 4 + 3);
    for value in CONFIG_TABLE {
        payload.extend_from_slice(&value.to_le_bytes());
    }
    payload.extend_from_slice(&0x0013u16.to_le_bytes());
    payload.push(0x00);
    payload
}

/// One parsed control frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlPacket {
    pub ptype: u16,
    pub payload: Vec<u8>,
}

/// Write one frame.
///
/// `declared_len` goes into the header independently of the actual payload:
/// the host expects the CONFIG frame to declare a length of 4 while carrying
/// the full table, so the mismatch is part of the wire format.
pub async fn write_packet(
    stream: &mut (impl AsyncWrite + Unpin),
    ptype: u16,
    declared_len: u16,
    payload: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&ptype.to_le_bytes());
    frame.extend_from_slice(&declared_len.to_le_bytes());
    frame.extend_from_slice(payload);
    stream.write_all(&frame).await?;
    stream.flush().await
}

/// Read one frame, blocking until the declared length is satisfied.
pub async fn read_packet(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<CtlPacket, ControlError> {
    let mut header = [0u8; 4];
    read_fully(stream, &mut header).await?;

    let ptype = u16::from_le_bytes([header[0], header[1]]);
    let length = u16::from_le_bytes([header[2], header[3]]);

    let mut payload = vec![0u8; length as usize];
    read_fully(stream, &mut payload).await?;

    Ok(CtlPacket { ptype, payload })
}

async fn read_fully(
    stream: &mut (impl AsyncRead + Unpin),
    buf: &mut [u8],
) -> Result<(), ControlError> {
    stream.read_exact(buf).await.map(|_| ()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            ControlError::SocketClosed
        } else {
            ControlError::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn config_payload_has_wire_size_and_tail() {
        let payload = config_payload();
        assert_eq!(payload.len(), 97 * 4 + 3);
        assert_eq!(payload[0..4], 720u32.to_le_bytes());
        assert_eq!(payload[payload.len() - 3..], [0x13, 0x00, 0x00]);
    }

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (mut client, mut server) = tokio::io::duplex(256);

        write_packet(&mut client, PTYPE_JITTER, 4, &[1, 2, 3, 4])
            .await
            .unwrap();
        let packet = read_packet(&mut server).await.unwrap();
        assert_eq!(packet.ptype, PTYPE_JITTER);
        assert_eq!(packet.payload, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn read_blocks_until_declared_length_arrives() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let reader = tokio::spawn(async move { read_packet(&mut server).await });

        // Header promises 8 payload bytes; deliver them in two halves with a
        // pause in between. The reader must wait for the second half.
        client
            .write_all(&[0x01, 0x14, 0x08, 0x00, 0xAA, 0xBB, 0xCC, 0xDD])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        client.write_all(&[0xEE, 0xFF, 0x11, 0x22]).await.unwrap();
        let packet = reader.await.unwrap().unwrap();
        assert_eq!(packet.payload.len(), 8);
        assert_eq!(packet.payload[7], 0x22);
    }

    #[tokio::test]
    async fn short_frame_surfaces_socket_closed() {
        let (mut client, mut server) = tokio::io::duplex(256);

        client
            .write_all(&[0x01, 0x14, 0x08, 0x00, 0xAA, 0xBB])
            .await
            .unwrap();
        drop(client);

        match read_packet(&mut server).await {
            Err(ControlError::SocketClosed) => {}
            other => panic!("expected SocketClosed, got {other:?}"),
        }
    }
}
