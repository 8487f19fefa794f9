//! Background pass state.
//!
//! The skybox draws an inverse cube (the manager's default mesh) with a
//! cubemap texture and the built-in skybox program, depth test disabled so
//! the background can never occlude scene geometry.  This type only tracks
//! which cubemap is bound and whether the pass runs; the manager owns the
//! mesh and program.

pub struct Skybox {
    texture: Option<u32>,
    enabled: bool,
    closed: bool,
}

impl Skybox {
    pub fn new() -> Self {
        Self {
            texture: None,
            enabled: true,
            closed: false,
        }
    }

    pub fn texture(&self) -> Option<u32> {
        self.texture
    }

    pub fn set_texture(&mut self, texture: Option<u32>) {
        self.texture = texture;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.closed
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Drops the texture reference when that texture closes.
    pub fn clear_texture_ref(&mut self, texture: u32) {
        if self.texture == Some(texture) {
            self.texture = None;
        }
    }

    pub fn close(&mut self) {
        self.texture = None;
        self.closed = true;
    }
}

impl Default for Skybox {
    fn default() -> Self {
        Self::new()
    }
}
