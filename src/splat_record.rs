// Fixed-stride splat record codec and the append-only record store.
//
// Wire layout, 32 bytes per record, little-endian:
//   f32 x, y, z        position (millimeters, source space)
//   f32 sx, sy, sz     anisotropic scale
//   u8  r, g, b, a     color + opacity
//   u8  qx, qy, qz, qw rotation quaternion, quantized as round(q * 128 + 128)

use anyhow::{bail, ensure, Context, Result};
use glam::{Mat3, Quat, Vec3};
use std::sync::Arc;

/// Exact byte stride of one splat record on the wire and in the store.
pub const RECORD_STRIDE: usize = 32;

/// Band-0 spherical harmonics coefficient, used to decode PLY DC color terms.
pub const SH_C0: f32 = 0.282_094_79;

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn inverse_sigmoid(y: f32) -> f32 {
    (y / (1.0 - y)).ln()
}

#[inline]
pub fn quantize_quat_component(q: f32) -> u8 {
    (q * 128.0 + 128.0).round().clamp(0.0, 255.0) as u8
}

#[inline]
pub fn dequantize_quat_component(b: u8) -> f32 {
    (b as f32 - 128.0) / 128.0
}

/// One decoded splat. The store keeps records in wire form; this view exists
/// for the sorting thread, the texture encoder, and tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SplatRecord {
    pub position: Vec3,
    pub scale: Vec3,
    pub color: [u8; 4],
    pub rotation: Quat,
}

impl SplatRecord {
    /// Decodes one record from the first [`RECORD_STRIDE`] bytes of `bytes`.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RECORD_STRIDE {
            return None;
        }
        let f = |o: usize| f32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        Some(Self {
            position: Vec3::new(f(0), f(4), f(8)),
            scale: Vec3::new(f(12), f(16), f(20)),
            color: [bytes[24], bytes[25], bytes[26], bytes[27]],
            rotation: Quat::from_xyzw(
                dequantize_quat_component(bytes[28]),
                dequantize_quat_component(bytes[29]),
                dequantize_quat_component(bytes[30]),
                dequantize_quat_component(bytes[31]),
            ),
        })
    }

    /// Encodes the record back into wire form.
    pub fn encode(&self) -> [u8; RECORD_STRIDE] {
        let mut out = [0u8; RECORD_STRIDE];
        out[0..4].copy_from_slice(&self.position.x.to_le_bytes());
        out[4..8].copy_from_slice(&self.position.y.to_le_bytes());
        out[8..12].copy_from_slice(&self.position.z.to_le_bytes());
        out[12..16].copy_from_slice(&self.scale.x.to_le_bytes());
        out[16..20].copy_from_slice(&self.scale.y.to_le_bytes());
        out[20..24].copy_from_slice(&self.scale.z.to_le_bytes());
        out[24..28].copy_from_slice(&self.color);
        out[28] = quantize_quat_component(self.rotation.x);
        out[29] = quantize_quat_component(self.rotation.y);
        out[30] = quantize_quat_component(self.rotation.z);
        out[31] = quantize_quat_component(self.rotation.w);
        out
    }

    /// Decodes only the position, without touching the rest of the record.
    #[inline]
    pub fn decode_position(bytes: &[u8]) -> Vec3 {
        let f = |o: usize| f32::from_le_bytes([bytes[o], bytes[o + 1], bytes[o + 2], bytes[o + 3]]);
        Vec3::new(f(0), f(4), f(8))
    }

    /// Upper triangle of the 3D covariance `Σ = M·Mᵀ` with `M = R·S`,
    /// in row-major order: `[σ00, σ01, σ02, σ11, σ12, σ22]`.
    pub fn covariance(&self) -> [f32; 6] {
        let r = Mat3::from_quat(self.rotation.normalize());
        // glam is column-major, so scaling column i by scale[i] builds R·S.
        let m = Mat3::from_cols(
            r.x_axis * self.scale.x,
            r.y_axis * self.scale.y,
            r.z_axis * self.scale.z,
        );
        let sigma = m * m.transpose();
        [
            sigma.x_axis.x,
            sigma.y_axis.x,
            sigma.z_axis.x,
            sigma.y_axis.y,
            sigma.z_axis.y,
            sigma.z_axis.z,
        ]
    }
}

/// Append-only byte buffer holding every loaded record, shared across regions
/// via byte offsets. Single writer (the stream loader driver); the sorting
/// thread only ever sees immutable snapshots.
#[derive(Default)]
pub struct SplatStore {
    bytes: Vec<u8>,
}

impl SplatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    #[inline]
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Number of complete records currently in the store. A trailing partial
    /// record (mid-chunk) is not counted.
    #[inline]
    pub fn record_count(&self) -> usize {
        self.bytes.len() / RECORD_STRIDE
    }

    pub fn record(&self, index: usize) -> Option<SplatRecord> {
        let start = index.checked_mul(RECORD_STRIDE)?;
        self.bytes.get(start..start + RECORD_STRIDE).and_then(SplatRecord::decode)
    }

    /// Drops a trailing partial record, if any. Called when a stream ends
    /// short so the next region's records stay stride-aligned.
    pub fn truncate_partial(&mut self) -> usize {
        let complete = self.record_count() * RECORD_STRIDE;
        let removed = self.bytes.len() - complete;
        self.bytes.truncate(complete);
        removed
    }

    /// Immutable snapshot of all complete records, handed to the sorting
    /// thread. Ownership of the snapshot transfers via the message channel;
    /// the store itself is never shared.
    pub fn snapshot(&self) -> Arc<[u8]> {
        let complete = self.record_count() * RECORD_STRIDE;
        Arc::from(&self.bytes[..complete])
    }
}

// --- PLY ingestion ---------------------------------------------------------

#[derive(Clone, Copy)]
enum PlyScalar {
    F32,
    F64,
    I32,
    I16,
    U8,
}

impl PlyScalar {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "float" | "float32" => Some(Self::F32),
            "double" | "float64" => Some(Self::F64),
            "int" | "uint" | "int32" | "uint32" => Some(Self::I32),
            "short" | "ushort" | "int16" | "uint16" => Some(Self::I16),
            "char" | "uchar" | "int8" | "uint8" => Some(Self::U8),
            _ => None,
        }
    }

    fn size(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 => 8,
            Self::I16 => 2,
            Self::U8 => 1,
        }
    }

    fn read(self, bytes: &[u8]) -> f32 {
        match self {
            Self::F32 => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            Self::F64 => f64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]) as f32,
            Self::I32 => i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f32,
            Self::I16 => i16::from_le_bytes([bytes[0], bytes[1]]) as f32,
            Self::U8 => bytes[0] as f32,
        }
    }
}

struct PlyLayout {
    vertex_count: usize,
    row_stride: usize,
    body_offset: usize,
    properties: Vec<(String, PlyScalar, usize)>,
}

impl PlyLayout {
    fn offset_of(&self, name: &str) -> Option<(PlyScalar, usize)> {
        self.properties
            .iter()
            .find(|(n, _, _)| n == name)
            .map(|(_, ty, off)| (*ty, *off))
    }

    fn read(&self, row: &[u8], name: &str) -> Option<f32> {
        let (ty, off) = self.offset_of(name)?;
        Some(ty.read(&row[off..]))
    }
}

fn parse_ply_header(bytes: &[u8]) -> Result<PlyLayout> {
    const MARKER: &[u8] = b"end_header\n";
    let scan = &bytes[..bytes.len().min(64 * 1024)];
    let end = scan
        .windows(MARKER.len())
        .position(|w| w == MARKER)
        .context("PLY header terminator not found")?;
    let header = std::str::from_utf8(&bytes[..end]).context("PLY header is not valid UTF-8")?;

    let mut vertex_count = None;
    let mut properties = Vec::new();
    let mut row_stride = 0usize;
    for line in header.lines() {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("format") => {
                let fmt = parts.next().unwrap_or("");
                ensure!(fmt == "binary_little_endian", "unsupported PLY format {fmt}");
            }
            Some("element") => {
                if parts.next() == Some("vertex") {
                    vertex_count = parts
                        .next()
                        .and_then(|v| v.parse::<usize>().ok());
                } else if vertex_count.is_some() && !properties.is_empty() {
                    // Only the vertex element matters; stop before any
                    // trailing face/edge elements redefine properties.
                    break;
                }
            }
            Some("property") if vertex_count.is_some() => {
                let ty_name = parts.next().unwrap_or("");
                let ty = PlyScalar::parse(ty_name)
                    .with_context(|| format!("unsupported PLY property type {ty_name}"))?;
                let name = parts.next().unwrap_or("").to_string();
                properties.push((name, ty, row_stride));
                row_stride += ty.size();
            }
            _ => {}
        }
    }

    let vertex_count = vertex_count.context("PLY header has no vertex element")?;
    ensure!(row_stride > 0, "PLY vertex element has no properties");
    Ok(PlyLayout {
        vertex_count,
        row_stride,
        body_offset: end + MARKER.len(),
        properties,
    })
}

/// Converts a complete binary-little-endian PLY buffer into the fixed 32-byte
/// record layout. Log-scales are decoded with `exp()`, log-opacity with a
/// sigmoid, and the SH DC term with `0.5 + SH_C0 * f_dc`. Records are emitted
/// in descending `volume × opacity` order so the biggest contributors arrive
/// first when the result is streamed onward.
pub fn convert_ply(bytes: &[u8]) -> Result<Vec<u8>> {
    let layout = parse_ply_header(bytes)?;
    let body = &bytes[layout.body_offset..];
    ensure!(
        body.len() >= layout.vertex_count * layout.row_stride,
        "PLY body truncated: {} bytes for {} rows of {}",
        body.len(),
        layout.vertex_count,
        layout.row_stride
    );
    if layout.offset_of("x").is_none() {
        bail!("PLY vertex element has no x property");
    }

    let row = |i: usize| &body[i * layout.row_stride..(i + 1) * layout.row_stride];

    // Importance order: opacity-weighted volume, largest first.
    let mut order: Vec<u32> = (0..layout.vertex_count as u32).collect();
    let importance: Vec<f32> = (0..layout.vertex_count)
        .map(|i| {
            let r = row(i);
            let size = match layout.read(r, "scale_0") {
                Some(s0) => {
                    let s1 = layout.read(r, "scale_1").unwrap_or(s0);
                    let s2 = layout.read(r, "scale_2").unwrap_or(s0);
                    s0.exp() * s1.exp() * s2.exp()
                }
                None => 1.0,
            };
            let opacity = layout.read(r, "opacity").map(sigmoid).unwrap_or(1.0);
            size * opacity
        })
        .collect();
    order.sort_unstable_by(|&a, &b| {
        importance[b as usize]
            .partial_cmp(&importance[a as usize])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut out = Vec::with_capacity(layout.vertex_count * RECORD_STRIDE);
    for &i in &order {
        let r = row(i as usize);
        let position = Vec3::new(
            layout.read(r, "x").unwrap_or(0.0),
            layout.read(r, "y").unwrap_or(0.0),
            layout.read(r, "z").unwrap_or(0.0),
        );
        let scale = match layout.read(r, "scale_0") {
            Some(s0) => Vec3::new(
                s0.exp(),
                layout.read(r, "scale_1").unwrap_or(s0).exp(),
                layout.read(r, "scale_2").unwrap_or(s0).exp(),
            ),
            None => Vec3::splat(0.01),
        };
        let color = if let Some(dc0) = layout.read(r, "f_dc_0") {
            let dc1 = layout.read(r, "f_dc_1").unwrap_or(dc0);
            let dc2 = layout.read(r, "f_dc_2").unwrap_or(dc0);
            let to_u8 = |v: f32| ((0.5 + SH_C0 * v) * 255.0).clamp(0.0, 255.0) as u8;
            [to_u8(dc0), to_u8(dc1), to_u8(dc2)]
        } else {
            let to_u8 = |v: Option<f32>| v.unwrap_or(255.0).clamp(0.0, 255.0) as u8;
            [
                to_u8(layout.read(r, "red")),
                to_u8(layout.read(r, "green")),
                to_u8(layout.read(r, "blue")),
            ]
        };
        let alpha = layout
            .read(r, "opacity")
            .map(|o| (sigmoid(o) * 255.0).clamp(0.0, 255.0) as u8)
            .unwrap_or(255);
        // 3DGS PLY stores the quaternion as rot_0 = w, rot_1..3 = x, y, z.
        let rotation = match layout.read(r, "rot_0") {
            Some(w) => Quat::from_xyzw(
                layout.read(r, "rot_1").unwrap_or(0.0),
                layout.read(r, "rot_2").unwrap_or(0.0),
                layout.read(r, "rot_3").unwrap_or(0.0),
                w,
            )
            .normalize(),
            None => Quat::IDENTITY,
        };

        let record = SplatRecord {
            position,
            scale,
            color: [color[0], color[1], color[2], alpha],
            rotation,
        };
        out.extend_from_slice(&record.encode());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SplatRecord {
        SplatRecord {
            position: Vec3::new(120.5, -43.25, 881.0),
            scale: Vec3::new(12.0, 3.5, 0.75),
            color: [200, 64, 12, 230],
            rotation: Quat::from_rotation_y(0.7).normalize(),
        }
    }

    #[test]
    fn record_round_trips_within_quantization_error() {
        let original = sample_record();
        let decoded = SplatRecord::decode(&original.encode()).unwrap();
        assert_eq!(decoded.position, original.position);
        assert_eq!(decoded.scale, original.scale);
        assert_eq!(decoded.color, original.color);
        for (a, b) in decoded
            .rotation
            .to_array()
            .iter()
            .zip(original.rotation.to_array())
        {
            assert!((a - b).abs() <= 1.0 / 128.0, "quat component off: {a} vs {b}");
        }
    }

    #[test]
    fn decode_rejects_short_input() {
        assert!(SplatRecord::decode(&[0u8; RECORD_STRIDE - 1]).is_none());
    }

    #[test]
    fn covariance_of_axis_aligned_splat_is_diagonal() {
        let record = SplatRecord {
            position: Vec3::ZERO,
            scale: Vec3::new(2.0, 3.0, 4.0),
            color: [255; 4],
            rotation: Quat::IDENTITY,
        };
        let cov = record.covariance();
        assert!((cov[0] - 4.0).abs() < 1e-4);
        assert!((cov[3] - 9.0).abs() < 1e-4);
        assert!((cov[5] - 16.0).abs() < 1e-4);
        assert!(cov[1].abs() < 1e-4 && cov[2].abs() < 1e-4 && cov[4].abs() < 1e-4);
    }

    #[test]
    fn store_counts_only_complete_records() {
        let mut store = SplatStore::new();
        store.append(&sample_record().encode());
        store.append(&sample_record().encode()[..10]);
        assert_eq!(store.record_count(), 1);
        assert_eq!(store.byte_len(), RECORD_STRIDE + 10);
        store.append(&sample_record().encode()[10..]);
        assert_eq!(store.record_count(), 2);
        assert!(store.record(1).is_some());
        assert!(store.record(2).is_none());
    }

    fn synthetic_ply(count: usize) -> Vec<u8> {
        let mut ply = format!(
            "ply\nformat binary_little_endian 1.0\nelement vertex {count}\n"
        )
        .into_bytes();
        for name in [
            "x", "y", "z", "f_dc_0", "f_dc_1", "f_dc_2", "opacity", "scale_0", "scale_1",
            "scale_2", "rot_0", "rot_1", "rot_2", "rot_3",
        ] {
            ply.extend_from_slice(format!("property float {name}\n").as_bytes());
        }
        ply.extend_from_slice(b"end_header\n");
        for i in 0..count {
            let values = [
                i as f32,
                0.0,
                0.0,
                0.5,
                -0.5,
                0.0,
                inverse_sigmoid(0.8),
                (1.0f32 + i as f32).ln(),
                0.0,
                0.0,
                1.0,
                0.0,
                0.0,
                0.0,
            ];
            for v in values {
                ply.extend_from_slice(&v.to_le_bytes());
            }
        }
        ply
    }

    #[test]
    fn ply_converts_to_fixed_stride_with_decoded_fields() {
        let converted = convert_ply(&synthetic_ply(3)).unwrap();
        assert_eq!(converted.len(), 3 * RECORD_STRIDE);
        // Largest scale_0 wins the importance sort, so vertex 2 comes first.
        let first = SplatRecord::decode(&converted).unwrap();
        assert_eq!(first.position.x, 2.0);
        assert!((first.scale.x - 3.0).abs() < 1e-4);
        assert_eq!(first.color[3], (0.8f32 * 255.0) as u8);
        let expected_r = ((0.5 + SH_C0 * 0.5) * 255.0) as u8;
        assert_eq!(first.color[0], expected_r);
        assert!((first.rotation.w - 1.0).abs() <= 1.0 / 128.0);
    }

    #[test]
    fn ply_without_end_header_is_rejected() {
        let err = convert_ply(b"ply\nformat binary_little_endian 1.0\n").unwrap_err();
        assert!(err.to_string().contains("terminator"));
    }
}
