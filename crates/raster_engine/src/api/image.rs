//! Image-view contract
//!
//! An [`ImageView`] wraps caller-owned texel storage with a mip/layer layout
//! the engine can address. Mip chains are tightly packed per array layer;
//! [`SampledImageDescriptor`] flattens the layout into the plain-old-data
//! block generated sampler code reads by field offset.

use super::identity::{self, ImageViewKey};
use crate::pipeline::constants::MAX_MIP_LEVELS;
use crate::pipeline::texel;
use ash::vk;

/// POD image descriptor read by generated code
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SampledImageDescriptor {
    /// Base address of layer 0, level 0
    pub base: *const u8,
    /// Level-0 extent
    pub width: i32,
    /// Level-0 extent
    pub height: i32,
    /// Level-0 extent
    pub depth: i32,
    /// Number of mip levels
    pub mip_levels: i32,
    /// Number of array layers
    pub array_layers: i32,
    /// Bytes between consecutive array layers
    pub layer_pitch: i32,
    /// Byte offset of each level from the layer base
    pub level_offset: [i32; MAX_MIP_LEVELS],
    /// Bytes per row at each level
    pub row_pitch: [i32; MAX_MIP_LEVELS],
    /// Bytes per depth slice at each level
    pub slice_pitch: [i32; MAX_MIP_LEVELS],
}

// The descriptor is a snapshot of caller-guaranteed storage.
unsafe impl Send for SampledImageDescriptor {}
unsafe impl Sync for SampledImageDescriptor {}

/// Compact identity of the state bits that affect generated code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageViewIdentifier {
    /// Texel format
    pub format: vk::Format,
    /// Dimensionality
    pub view_type: vk::ImageViewType,
    /// Whether the view exposes exactly one mip level
    pub single_mip_level: bool,
}

/// Geometry of an image view
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    /// Texel format
    pub format: vk::Format,
    /// Dimensionality
    pub view_type: vk::ImageViewType,
    /// Level-0 width in texels
    pub width: u32,
    /// Level-0 height in texels
    pub height: u32,
    /// Level-0 depth in texels
    pub depth: u32,
    /// Mip levels in the view
    pub mip_levels: u32,
    /// Array layers in the view
    pub array_layers: u32,
}

/// A view over caller-owned texel storage
#[derive(Debug)]
pub struct ImageView {
    desc: ImageViewDesc,
    base: *mut u8,
    bytes_per_texel: u32,
    level_offset: [i32; MAX_MIP_LEVELS],
    row_pitch: [i32; MAX_MIP_LEVELS],
    slice_pitch: [i32; MAX_MIP_LEVELS],
    layer_pitch: i32,
    id: ImageViewKey,
}

unsafe impl Send for ImageView {}
unsafe impl Sync for ImageView {}

fn level_extent(extent: u32, level: u32) -> u32 {
    (extent >> level).max(1)
}

impl ImageView {
    /// Wraps storage at `base` laid out as tightly packed mip chains per
    /// layer. Panics on unsupported formats or zero extents.
    pub fn new(desc: ImageViewDesc, base: *mut u8) -> Self {
        assert!(desc.width > 0 && desc.height > 0 && desc.depth > 0);
        assert!(desc.mip_levels >= 1 && desc.mip_levels as usize <= MAX_MIP_LEVELS);
        assert!(desc.array_layers >= 1);
        let bytes_per_texel = texel::bytes_per_texel(desc.format)
            .unwrap_or_else(|e| panic!("image view: {e}"));

        let mut level_offset = [0i32; MAX_MIP_LEVELS];
        let mut row_pitch = [0i32; MAX_MIP_LEVELS];
        let mut slice_pitch = [0i32; MAX_MIP_LEVELS];
        let mut offset = 0i32;
        for level in 0..desc.mip_levels {
            let w = level_extent(desc.width, level) as i32;
            let h = level_extent(desc.height, level) as i32;
            let d = level_extent(desc.depth, level) as i32;
            let index = level as usize;
            level_offset[index] = offset;
            row_pitch[index] = w * bytes_per_texel as i32;
            slice_pitch[index] = row_pitch[index] * h;
            offset += slice_pitch[index] * d;
        }

        Self {
            desc,
            base,
            bytes_per_texel,
            level_offset,
            row_pitch,
            slice_pitch,
            layer_pitch: offset,
            id: identity::allocate_image_view(),
        }
    }

    /// Bytes of storage the layout requires
    pub fn required_size(desc: &ImageViewDesc) -> usize {
        let bytes = texel::bytes_per_texel(desc.format).expect("unsupported format") as usize;
        let mut total = 0usize;
        for level in 0..desc.mip_levels {
            let w = level_extent(desc.width, level) as usize;
            let h = level_extent(desc.height, level) as usize;
            let d = level_extent(desc.depth, level) as usize;
            total += w * h * d * bytes;
        }
        total * desc.array_layers as usize
    }

    /// The view's geometry
    pub fn desc(&self) -> &ImageViewDesc {
        &self.desc
    }

    /// Unique identity for sampling-routine cache keys
    pub fn id(&self) -> ImageViewKey {
        self.id
    }

    /// The code-affecting identity bits
    pub fn identifier(&self) -> ImageViewIdentifier {
        ImageViewIdentifier {
            format: self.desc.format,
            view_type: self.desc.view_type,
            single_mip_level: self.desc.mip_levels == 1,
        }
    }

    /// Pointer to the texel at `origin` in the given layer and level.
    /// The aspect selects the plane of combined depth/stencil formats; both
    /// aspects share interleaved texels in this layout.
    pub fn get_offset_pointer(
        &self,
        origin: (i32, i32, i32),
        _aspect: vk::ImageAspectFlags,
        layer: u32,
        level: u32,
    ) -> *mut u8 {
        assert!(level < self.desc.mip_levels);
        assert!(layer < self.desc.array_layers);
        let index = level as usize;
        let offset = layer as i64 * self.layer_pitch as i64
            + self.level_offset[index] as i64
            + origin.2 as i64 * self.slice_pitch[index] as i64
            + origin.1 as i64 * self.row_pitch[index] as i64
            + origin.0 as i64 * self.bytes_per_texel as i64;
        // SAFETY: callers pass in-bounds origins for caller-owned storage.
        unsafe { self.base.offset(offset as isize) }
    }

    /// Bytes per row at `level`
    pub fn row_pitch_bytes(&self, _aspect: vk::ImageAspectFlags, level: u32) -> i32 {
        self.row_pitch[level as usize]
    }

    /// Bytes per depth slice at `level`
    pub fn slice_pitch_bytes(&self, _aspect: vk::ImageAspectFlags, level: u32) -> i32 {
        self.slice_pitch[level as usize]
    }

    /// Bytes per texel of the view's format
    pub fn bytes_per_texel(&self) -> u32 {
        self.bytes_per_texel
    }

    /// Snapshot for generated code
    pub fn descriptor(&self) -> SampledImageDescriptor {
        SampledImageDescriptor {
            base: self.base,
            width: self.desc.width as i32,
            height: self.desc.height as i32,
            depth: self.desc.depth as i32,
            mip_levels: self.desc.mip_levels as i32,
            array_layers: self.desc.array_layers as i32,
            layer_pitch: self.layer_pitch,
            level_offset: self.level_offset,
            row_pitch: self.row_pitch,
            slice_pitch: self.slice_pitch,
        }
    }
}

impl Drop for ImageView {
    fn drop(&mut self) {
        identity::release_image_view(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view_2d(width: u32, height: u32, mips: u32) -> (Vec<u8>, ImageView) {
        let desc = ImageViewDesc {
            format: vk::Format::R8G8B8A8_UNORM,
            view_type: vk::ImageViewType::TYPE_2D,
            width,
            height,
            depth: 1,
            mip_levels: mips,
            array_layers: 1,
        };
        let mut storage = vec![0u8; ImageView::required_size(&desc)];
        let ptr = storage.as_mut_ptr();
        (storage, ImageView::new(desc, ptr))
    }

    #[test]
    fn test_mip_layout_is_tightly_packed() {
        let (_storage, view) = view_2d(8, 8, 4);
        let d = view.descriptor();
        assert_eq!(d.level_offset[0], 0);
        assert_eq!(d.level_offset[1], 8 * 8 * 4);
        assert_eq!(d.level_offset[2], 8 * 8 * 4 + 4 * 4 * 4);
        assert_eq!(d.row_pitch[1], 4 * 4);
        assert_eq!(d.row_pitch[3], 4); // 1×1 level
    }

    #[test]
    fn test_offset_pointer_walks_rows() {
        let (_storage, view) = view_2d(4, 4, 1);
        let base = view.get_offset_pointer((0, 0, 0), vk::ImageAspectFlags::COLOR, 0, 0);
        let one_down = view.get_offset_pointer((0, 1, 0), vk::ImageAspectFlags::COLOR, 0, 0);
        assert_eq!(one_down as usize - base as usize, 16);
        let diag = view.get_offset_pointer((2, 1, 0), vk::ImageAspectFlags::COLOR, 0, 0);
        assert_eq!(diag as usize - base as usize, 16 + 8);
    }

    #[test]
    fn test_identifier_tracks_single_mip() {
        let (_s1, single) = view_2d(4, 4, 1);
        let (_s2, chain) = view_2d(4, 4, 3);
        assert!(single.identifier().single_mip_level);
        assert!(!chain.identifier().single_mip_level);
        assert_ne!(single.id(), chain.id());
    }
}
