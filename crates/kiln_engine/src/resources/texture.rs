//! 2-D and cubemap textures.
//!
//! Pixel data arrives as raw RGBA8 (asset decoding happens upstream); the
//! texture unit is fixed at construction and bounds-checked against the
//! backend's combined-unit limit.  The optional source identity doubles as
//! the registry dedup key, so two textures from the same logical asset share
//! one GPU upload.
//!
//! Cubemaps come either from six explicit faces or from a single packed
//! image whose aspect ratio selects the layout:
//!
//! | ratio | layout                    | face side |
//! |-------|---------------------------|-----------|
//! | 6:1   | row strip  +X −X +Y −Y +Z −Z | height |
//! | 4:3   | horizontal cross          | width / 4 |
//! | 3:4   | vertical cross            | width / 3 |
//! | 1:6   | column strip (same order) | width     |
//!
//! Crosses place −X,+Z,+X,−Z across the middle row with +Y above and −Y
//! below +Z; the vertical cross keeps −Z at the bottom of the center column.
//! Any other ratio is rejected.

use crate::backend::{ProgramMode, RenderBackend, TextureId};
use crate::error::EngineError;

/// Raw RGBA8 pixel rectangle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl TextureData {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, EngineError> {
        if width == 0 || height == 0 {
            return Err(EngineError::InvalidTexture("zero-sized texture".into()));
        }
        let expected = width as usize * height as usize * 4;
        if rgba.len() != expected {
            return Err(EngineError::InvalidTexture(format!(
                "{} payload bytes for {width}x{height} RGBA (expected {expected})",
                rgba.len()
            )));
        }
        Ok(Self {
            width,
            height,
            rgba,
        })
    }

    /// A 1×1 texture of one color, used for the default white texture.
    pub fn solid(rgba: [u8; 4]) -> Self {
        Self {
            width: 1,
            height: 1,
            rgba: rgba.to_vec(),
        }
    }

    fn rect(&self, x: u32, y: u32, side: u32) -> TextureData {
        let mut out = Vec::with_capacity(side as usize * side as usize * 4);
        for row in 0..side {
            let start = (((y + row) * self.width + x) * 4) as usize;
            out.extend_from_slice(&self.rgba[start..start + side as usize * 4]);
        }
        TextureData {
            width: side,
            height: side,
            rgba: out,
        }
    }
}

/// How a single packed image stores six cubemap faces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CubemapLayout {
    RowStrip,
    HorizontalCross,
    VerticalCross,
    ColumnStrip,
}

impl CubemapLayout {
    /// Detects the layout from packed-image dimensions; `None` when the
    /// ratio matches no supported packing.  Returns the face side length.
    pub fn detect(width: u32, height: u32) -> Option<(Self, u32)> {
        if width == height * 6 {
            Some((Self::RowStrip, height))
        } else if height == width * 6 {
            Some((Self::ColumnStrip, width))
        } else if width * 3 == height * 4 && width % 4 == 0 {
            Some((Self::HorizontalCross, width / 4))
        } else if width * 4 == height * 3 && width % 3 == 0 {
            Some((Self::VerticalCross, width / 3))
        } else {
            None
        }
    }

    /// Grid cell (column, row) of each face, ordered +X, −X, +Y, −Y, +Z, −Z.
    fn cells(self) -> [(u32, u32); 6] {
        match self {
            Self::RowStrip => [(0, 0), (1, 0), (2, 0), (3, 0), (4, 0), (5, 0)],
            Self::ColumnStrip => [(0, 0), (0, 1), (0, 2), (0, 3), (0, 4), (0, 5)],
            Self::HorizontalCross => [(2, 1), (0, 1), (1, 0), (1, 2), (1, 1), (3, 1)],
            Self::VerticalCross => [(2, 1), (0, 1), (1, 0), (1, 2), (1, 1), (1, 3)],
        }
    }
}

/// Splits a packed cubemap image into its six faces.
pub fn split_packed(image: &TextureData) -> Result<(u32, [TextureData; 6]), EngineError> {
    let (layout, side) = CubemapLayout::detect(image.width, image.height).ok_or_else(|| {
        EngineError::InvalidTexture(format!(
            "{}x{} matches no cubemap packing (need 6:1, 4:3, 3:4 or 1:6)",
            image.width, image.height
        ))
    })?;
    let cells = layout.cells();
    let faces = cells.map(|(col, row)| image.rect(col * side, row * side, side));
    Ok((side, faces))
}

// ── 2-D texture ──────────────────────────────────────────────────────────────

pub struct Texture2d {
    unit: u32,
    identity: Option<String>,
    data: TextureData,
    handle: Option<TextureId>,
    closed: bool,
}

impl Texture2d {
    pub fn new(
        unit: u32,
        data: TextureData,
        identity: Option<String>,
        max_units: u32,
    ) -> Result<Self, EngineError> {
        check_unit(unit, max_units)?;
        Ok(Self {
            unit,
            identity,
            data,
            handle: None,
            closed: false,
        })
    }
}

// ── Cubemap texture ──────────────────────────────────────────────────────────

pub struct TextureCubemap {
    unit: u32,
    identity: Option<String>,
    side: u32,
    faces: Box<[TextureData; 6]>,
    handle: Option<TextureId>,
    closed: bool,
}

impl TextureCubemap {
    /// From six explicit faces, ordered +X, −X, +Y, −Y, +Z, −Z.  All faces
    /// must be square and share one side length.
    pub fn from_faces(
        unit: u32,
        faces: Box<[TextureData; 6]>,
        identity: Option<String>,
        max_units: u32,
    ) -> Result<Self, EngineError> {
        check_unit(unit, max_units)?;
        let side = faces[0].width;
        if faces.iter().any(|f| f.width != side || f.height != side) {
            return Err(EngineError::InvalidTexture(
                "cubemap faces must be square and equally sized".into(),
            ));
        }
        Ok(Self {
            unit,
            identity,
            side,
            faces,
            handle: None,
            closed: false,
        })
    }

    /// From one packed image; the aspect ratio selects the layout.
    pub fn from_packed(
        unit: u32,
        image: &TextureData,
        identity: Option<String>,
        max_units: u32,
    ) -> Result<Self, EngineError> {
        check_unit(unit, max_units)?;
        let (side, faces) = split_packed(image)?;
        Ok(Self {
            unit,
            identity,
            side,
            faces: Box::new(faces),
            handle: None,
            closed: false,
        })
    }

    pub fn side(&self) -> u32 {
        self.side
    }

    pub fn face(&self, index: usize) -> &TextureData {
        &self.faces[index]
    }
}

fn check_unit(unit: u32, max_units: u32) -> Result<(), EngineError> {
    if unit >= max_units {
        return Err(EngineError::InvalidTexture(format!(
            "texture unit {unit} out of range (hardware maximum {max_units})"
        )));
    }
    Ok(())
}

// ── Registry entry ───────────────────────────────────────────────────────────

/// A registered texture of either kind.
pub enum Texture {
    Flat(Texture2d),
    Cube(TextureCubemap),
}

impl Texture {
    pub fn unit(&self) -> u32 {
        match self {
            Self::Flat(t) => t.unit,
            Self::Cube(t) => t.unit,
        }
    }

    /// The program mode this texture is compatible with.
    pub fn mode(&self) -> ProgramMode {
        match self {
            Self::Flat(_) => ProgramMode::Flat,
            Self::Cube(_) => ProgramMode::Cubemap,
        }
    }

    pub fn identity(&self) -> Option<&str> {
        match self {
            Self::Flat(t) => t.identity.as_deref(),
            Self::Cube(t) => t.identity.as_deref(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            Self::Flat(t) => t.closed,
            Self::Cube(t) => t.closed,
        }
    }

    /// Uploads on first use and returns the GPU handle.  Render-thread only.
    pub fn sync(&mut self, backend: &mut dyn RenderBackend) -> Result<TextureId, EngineError> {
        match self {
            Self::Flat(t) => {
                if t.closed {
                    return Err(EngineError::ObjectClosed);
                }
                if let Some(h) = t.handle {
                    return Ok(h);
                }
                let h = backend.create_texture_2d(t.data.width, t.data.height, &t.data.rgba)?;
                t.handle = Some(h);
                Ok(h)
            }
            Self::Cube(t) => {
                if t.closed {
                    return Err(EngineError::ObjectClosed);
                }
                if let Some(h) = t.handle {
                    return Ok(h);
                }
                let faces: [Vec<u8>; 6] = [
                    t.faces[0].rgba.clone(),
                    t.faces[1].rgba.clone(),
                    t.faces[2].rgba.clone(),
                    t.faces[3].rgba.clone(),
                    t.faces[4].rgba.clone(),
                    t.faces[5].rgba.clone(),
                ];
                let h = backend.create_texture_cubemap(t.side, &faces)?;
                t.handle = Some(h);
                Ok(h)
            }
        }
    }

    /// Releases the GPU handle and marks the texture closed.  Idempotent.
    pub fn close(&mut self, backend: &mut dyn RenderBackend) {
        let handle = match self {
            Self::Flat(t) => {
                t.closed = true;
                t.handle.take()
            }
            Self::Cube(t) => {
                t.closed = true;
                t.handle.take()
            }
        };
        if let Some(h) = handle {
            backend.destroy_texture(h);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Packed image where every face cell is filled with a distinct byte.
    fn packed(width: u32, height: u32, side: u32, cells: &[(u32, u32)]) -> TextureData {
        let mut rgba = vec![0u8; (width * height * 4) as usize];
        for (i, (col, row)) in cells.iter().enumerate() {
            let value = (i + 1) as u8;
            for y in 0..side {
                for x in 0..side {
                    let px = ((row * side + y) * width + col * side + x) as usize * 4;
                    rgba[px..px + 4].copy_from_slice(&[value; 4]);
                }
            }
        }
        TextureData::new(width, height, rgba).unwrap()
    }

    #[test]
    fn detect_supported_ratios() {
        assert_eq!(
            CubemapLayout::detect(96, 16),
            Some((CubemapLayout::RowStrip, 16))
        );
        assert_eq!(
            CubemapLayout::detect(16, 96),
            Some((CubemapLayout::ColumnStrip, 16))
        );
        assert_eq!(
            CubemapLayout::detect(64, 48),
            Some((CubemapLayout::HorizontalCross, 16))
        );
        assert_eq!(
            CubemapLayout::detect(48, 64),
            Some((CubemapLayout::VerticalCross, 16))
        );
    }

    #[test]
    fn detect_rejects_other_ratios() {
        assert_eq!(CubemapLayout::detect(80, 16), None); // width = height*5
        assert_eq!(CubemapLayout::detect(32, 32), None);
        assert_eq!(CubemapLayout::detect(100, 30), None);
    }

    #[test]
    fn row_strip_faces_come_out_in_order() {
        let image = packed(24, 4, 4, &CubemapLayout::RowStrip.cells());
        let (side, faces) = split_packed(&image).unwrap();
        assert_eq!(side, 4);
        for (i, face) in faces.iter().enumerate() {
            assert!(
                face.rgba.iter().all(|&b| b == (i + 1) as u8),
                "face {i} not extracted from its strip cell"
            );
        }
    }

    #[test]
    fn horizontal_cross_extracts_correct_cells() {
        let image = packed(16, 12, 4, &CubemapLayout::HorizontalCross.cells());
        let (_, faces) = split_packed(&image).unwrap();
        for (i, face) in faces.iter().enumerate() {
            assert!(face.rgba.iter().all(|&b| b == (i + 1) as u8));
        }
    }

    #[test]
    fn vertical_cross_extracts_correct_cells() {
        let image = packed(12, 16, 4, &CubemapLayout::VerticalCross.cells());
        let (_, faces) = split_packed(&image).unwrap();
        for (i, face) in faces.iter().enumerate() {
            assert!(face.rgba.iter().all(|&b| b == (i + 1) as u8));
        }
    }

    #[test]
    fn texture_unit_is_bounds_checked() {
        let data = TextureData::solid([255; 4]);
        assert!(Texture2d::new(15, data.clone(), None, 16).is_ok());
        assert!(matches!(
            Texture2d::new(16, data, None, 16),
            Err(EngineError::InvalidTexture(_))
        ));
    }

    #[test]
    fn payload_size_is_validated() {
        assert!(matches!(
            TextureData::new(2, 2, vec![0; 15]),
            Err(EngineError::InvalidTexture(_))
        ));
    }
}
