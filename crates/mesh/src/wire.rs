use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{MeshError, Result};
use crate::peer::PeerIdentity;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_FRAME_SIZE: usize = 1024 * 1024; // 1 MB
pub const MAX_BEACON_SIZE: usize = 1024;

/// Presence datagram multicast by the advertiser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Beacon {
    pub protocol_version: u32,
    pub service: String,
    pub peer: PeerIdentity,
    pub session_port: u16,
    /// Set on the last beacon sent when advertising stops.
    pub goodbye: bool,
}

impl Beacon {
    pub fn new(service: &str, peer: PeerIdentity, session_port: u16) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            service: service.to_string(),
            peer,
            session_port,
            goodbye: false,
        }
    }

    pub fn goodbye(mut self) -> Self {
        self.goodbye = true;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_BEACON_SIZE {
            return Err(MeshError::MessageTooLarge(data.len()));
        }
        Ok(bincode::deserialize(data)?)
    }
}

/// Frames exchanged on a session link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    // Handshake
    Invite {
        protocol_version: u32,
        service: String,
        from: PeerIdentity,
    },
    Accept {
        from: PeerIdentity,
    },
    Reject {
        from: PeerIdentity,
        reason: String,
    },

    // Session
    Data {
        text: String,
    },
    Ping {
        seq: u64,
    },
    Bye,
}

impl Frame {
    pub fn invite(service: &str, from: PeerIdentity) -> Self {
        Frame::Invite {
            protocol_version: PROTOCOL_VERSION,
            service: service.to_string(),
            from,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Frame::Invite { .. } => "invite",
            Frame::Accept { .. } => "accept",
            Frame::Reject { .. } => "reject",
            Frame::Data { .. } => "data",
            Frame::Ping { .. } => "ping",
            Frame::Bye => "bye",
        }
    }
}

/// Write one frame as `[len: u32 BE][bincode]`.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let data = frame.encode()?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(MeshError::MessageTooLarge(data.len()));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean EOF at a frame boundary.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(MeshError::MessageTooLarge(len));
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await?;
    Frame::decode(&data).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_survive_a_stream() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let alice = PeerIdentity::new("alice", "alice");

        write_frame(&mut client, &Frame::invite("MESP", alice.clone()))
            .await
            .unwrap();
        write_frame(&mut client, &Frame::Data { text: "héllo".into() })
            .await
            .unwrap();
        drop(client);

        match read_frame(&mut server).await.unwrap() {
            Some(Frame::Invite { service, from, .. }) => {
                assert_eq!(service, "MESP");
                assert_eq!(from, alice);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(
            read_frame(&mut server).await.unwrap(),
            Some(Frame::Data { text: "héllo".into() })
        );
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let bogus = (MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        client.write_all(&bogus).await.unwrap();

        let result = read_frame(&mut server).await;
        assert!(matches!(result, Err(MeshError::MessageTooLarge(_))));
    }

    #[test]
    fn test_goodbye_beacon() {
        let beacon = Beacon::new("MESP", PeerIdentity::new("a", "a"), 4000).goodbye();
        let decoded = Beacon::decode(&beacon.encode().unwrap()).unwrap();
        assert!(decoded.goodbye);
        assert_eq!(decoded.session_port, 4000);
        assert!(Beacon::decode(&[0xff; 3]).is_err());
    }
}
