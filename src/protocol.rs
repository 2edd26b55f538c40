//! TCP protocol for grasp-client ↔ grasp-server communication.
//!
//! Self-contained: no imports from other graspnet_server modules.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

// --- Image buffer types ---

/// Pixel layout of a raw image buffer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageEncoding {
    /// Interleaved RGB, 1 byte per channel
    Rgb8,
    /// Little-endian f32 meters, 4 bytes per pixel
    Depth32F,
    /// Segment id, 1 byte per pixel
    Seg8,
    /// Segment id, little-endian u16 per pixel
    Seg16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBuffer {
    pub width: u32,
    pub height: u32,
    pub encoding: ImageEncoding,
    pub data: Vec<u8>,
}

// --- Message types ---

/// Client → Server
#[derive(Serialize, Deserialize, Debug)]
pub enum ClientMessage {
    GraspRequest {
        request_id: u64,
        rgb: ImageBuffer,
        depth: ImageBuffer,
        seg: ImageBuffer,
        /// Intrinsic matrix K (row-major 3x3)
        camera_k: [f64; 9],
        /// Segment id to return grasps for
        segmap_id: i32,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GraspPose {
    /// Grasp pose in camera frame (row-major flattened 4x4)
    pub pose: [f32; 16],
    pub score: f32,
    pub contact_pt: [f32; 3],
}

/// Server → Client
#[derive(Serialize, Deserialize, Debug)]
pub enum ServerMessage {
    GraspResult {
        request_id: u64,
        grasps: Vec<GraspPose>,
    },
    GraspError {
        request_id: u64,
        message: String,
    },
}

// --- TCP codec helpers ---

pub type MessageStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Create a framed message stream with length-delimited framing.
pub fn message_stream(stream: TcpStream) -> MessageStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(16 * 1024 * 1024) // 16MB
        .new_codec();
    Framed::new(stream, codec)
}

/// Send a serializable message (bincode + length prefix).
pub async fn send_message<T: Serialize>(
    stream: &mut MessageStream,
    msg: &T,
) -> anyhow::Result<()> {
    let data = bincode::serialize(msg)?;
    stream.send(Bytes::from(data)).await?;
    Ok(())
}

/// Receive and deserialize a message.
pub async fn recv_message<T: DeserializeOwned>(
    stream: &mut MessageStream,
) -> anyhow::Result<T> {
    match stream.next().await {
        Some(Ok(bytes)) => Ok(bincode::deserialize(&bytes)?),
        Some(Err(e)) => Err(e.into()),
        None => Err(anyhow::anyhow!("connection closed")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grasp_request_bincode_roundtrip() {
        let msg = ClientMessage::GraspRequest {
            request_id: 42,
            rgb: ImageBuffer {
                width: 2,
                height: 1,
                encoding: ImageEncoding::Rgb8,
                data: vec![10, 20, 30, 40, 50, 60],
            },
            depth: ImageBuffer {
                width: 2,
                height: 1,
                encoding: ImageEncoding::Depth32F,
                data: 0.5f32
                    .to_le_bytes()
                    .iter()
                    .chain(0.7f32.to_le_bytes().iter())
                    .copied()
                    .collect(),
            },
            seg: ImageBuffer {
                width: 2,
                height: 1,
                encoding: ImageEncoding::Seg8,
                data: vec![0, 1],
            },
            camera_k: [500.0, 0.0, 1.0, 0.0, 500.0, 0.5, 0.0, 0.0, 1.0],
            segmap_id: 1,
        };

        let bytes = bincode::serialize(&msg).unwrap();
        match bincode::deserialize(&bytes).unwrap() {
            ClientMessage::GraspRequest { request_id, rgb, camera_k, segmap_id, .. } => {
                assert_eq!(request_id, 42);
                assert_eq!(rgb.data.len(), 6);
                assert_eq!(camera_k[0], 500.0);
                assert_eq!(segmap_id, 1);
            }
        }
    }

    #[test]
    fn test_grasp_result_bincode_roundtrip() {
        let msg = ServerMessage::GraspResult {
            request_id: 7,
            grasps: vec![GraspPose {
                pose: [0.0; 16],
                score: 0.9,
                contact_pt: [0.1, 0.2, 0.3],
            }],
        };
        let bytes = bincode::serialize(&msg).unwrap();
        match bincode::deserialize(&bytes).unwrap() {
            ServerMessage::GraspResult { request_id, grasps } => {
                assert_eq!(request_id, 7);
                assert_eq!(grasps.len(), 1);
                assert_eq!(grasps[0].contact_pt, [0.1, 0.2, 0.3]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
