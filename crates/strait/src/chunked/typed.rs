//! Typed conveniences over [`ChunkedTransport::send_buffer`].
//!
//! Numeric buffers go over the wire as little-endian element bytes.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value, json};
use strait_proto::{BufferFormat, FRAME_OVERHEAD, MAX_FRAME_LEN};

use super::{ChunkedTransport, TransferReport};
use crate::error::TransferError;

pub fn f64_bytes(values: &[f64]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub fn i32_bytes(values: &[i32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

fn u32_bytes(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|value| value.to_le_bytes()).collect()
}

pub fn encode_f64s(values: &[f64]) -> String {
    STANDARD.encode(f64_bytes(values))
}

pub fn encode_f32s(values: &[f32]) -> String {
    STANDARD.encode(f32_bytes(values))
}

pub fn encode_i32s(values: &[i32]) -> String {
    STANDARD.encode(i32_bytes(values))
}

/// A triangle mesh. Points, normals and tangents are xyz triples, uvs are
/// pairs and triangles index into the points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry<'a> {
    pub name: &'a str,
    pub points: &'a [f64],
    pub triangles: &'a [u32],
    pub normals: Option<&'a [f64]>,
    pub uvs: Option<&'a [f64]>,
    pub tangents: Option<&'a [f64]>,
}

impl<'a> Geometry<'a> {
    pub fn new(name: &'a str, points: &'a [f64], triangles: &'a [u32]) -> Self {
        Self {
            name,
            points,
            triangles,
            normals: None,
            uvs: None,
            tangents: None,
        }
    }

    pub fn with_normals(mut self, normals: &'a [f64]) -> Self {
        self.normals = Some(normals);
        self
    }

    pub fn with_uvs(mut self, uvs: &'a [f64]) -> Self {
        self.uvs = Some(uvs);
        self
    }

    pub fn with_tangents(mut self, tangents: &'a [f64]) -> Self {
        self.tangents = Some(tangents);
        self
    }

    /// Buffer name and little-endian bytes of every present part, in send order.
    fn parts(&self) -> Vec<(&'static str, Vec<u8>)> {
        let mut parts = vec![
            ("points", f64_bytes(self.points)),
            ("triangles", u32_bytes(self.triangles)),
        ];
        if let Some(normals) = self.normals {
            parts.push(("normals", f64_bytes(normals)));
        }
        if let Some(uvs) = self.uvs {
            parts.push(("uvs", f64_bytes(uvs)));
        }
        if let Some(tangents) = self.tangents {
            parts.push(("tangents", f64_bytes(tangents)));
        }
        parts
    }

    /// Single-message form of the mesh.
    pub fn direct_message(&self) -> Value {
        let mut message = Map::new();
        message.insert("type".into(), json!("directbase64"));
        message.insert("name".into(), json!(self.name));
        for (part, bytes) in self.parts() {
            let key = if part == "uvs" { "texcoords" } else { part };
            message.insert(key.into(), json!(STANDARD.encode(bytes)));
        }
        Value::Object(message)
    }
}

/// How [`ChunkedTransport::send_geometry`] delivered a mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeometryDelivery {
    Direct,
    Chunked(Vec<(&'static str, TransferReport)>),
}

impl ChunkedTransport {
    pub fn send_f64s(
        &self,
        name: &str,
        values: &[f64],
        format: BufferFormat,
    ) -> Result<TransferReport, TransferError> {
        self.send_buffer(name, &f64_bytes(values), format)
    }

    pub fn send_f32s(
        &self,
        name: &str,
        values: &[f32],
        format: BufferFormat,
    ) -> Result<TransferReport, TransferError> {
        self.send_buffer(name, &f32_bytes(values), format)
    }

    pub fn send_i32s(
        &self,
        name: &str,
        values: &[i32],
        format: BufferFormat,
    ) -> Result<TransferReport, TransferError> {
        self.send_buffer(name, &i32_bytes(values), format)
    }

    /// Sends a mesh as one `directbase64` message when it fits, otherwise as
    /// one base64 buffer per part followed by a `spawn` message.
    pub fn send_geometry(&self, geometry: &Geometry<'_>) -> Result<GeometryDelivery, TransferError> {
        if self.session().is_worker_thread() {
            return Err(TransferError::WouldDeadlock);
        }
        let direct = geometry.direct_message();
        let budget = self.session().max_message_size().min(MAX_FRAME_LEN);
        if direct.to_string().len() + FRAME_OVERHEAD <= budget {
            self.session().send_json(&direct)?;
            tracing::debug!(target = "strait::chunked", name = geometry.name, "geometry sent in one message");
            return Ok(GeometryDelivery::Direct);
        }

        let mut reports = Vec::new();
        for (part, bytes) in geometry.parts() {
            let report = self.send_buffer(part, &bytes, BufferFormat::Base64)?;
            reports.push((part, report));
        }
        self.session()
            .send_json(&json!({"type": "spawn", "object": "ProceduralMeshComponent"}))?;
        tracing::debug!(
            target = "strait::chunked",
            name = geometry.name,
            parts = reports.len(),
            "geometry sent in buffers"
        );
        Ok(GeometryDelivery::Chunked(reports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f64_golden_vector() {
        assert_eq!(
            encode_f64s(&[1.0, 2.0, 3.0, 4.0]),
            "AAAAAAAA8D8AAAAAAAAAQAAAAAAAAAhAAAAAAAAAEEA="
        );
    }

    #[test]
    fn elements_are_little_endian() {
        assert_eq!(i32_bytes(&[1, -1]), vec![1, 0, 0, 0, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(f32_bytes(&[1.0]), vec![0, 0, 0x80, 0x3f]);
        assert_eq!(encode_i32s(&[]), "");
        assert_eq!(encode_f32s(&[1.0]), "AACAPw==");
    }

    #[test]
    fn direct_message_names_parts() {
        let points = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
        let triangles = [0, 1, 2];
        let uvs = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
        let geometry = Geometry::new("tri", &points, &triangles).with_uvs(&uvs);
        let message = geometry.direct_message();
        assert_eq!(message["type"], "directbase64");
        assert_eq!(message["name"], "tri");
        assert_eq!(message["triangles"], STANDARD.encode(u32_bytes(&triangles)));
        assert!(message.get("texcoords").is_some());
        assert!(message.get("normals").is_none());
    }
}
