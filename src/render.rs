//! Streamline snapshot renderer
//!
//! Draws the merged streamline tubes once into an offscreen render target,
//! reads the pixels back and saves them as a PNG.

use anyhow::Context as _;
use std::path::Path;
use three_d::*;
use tracing::info;

use crate::geometry::{Mesh as TubeMesh, Point3, StreamlineActor};

/// Light direction baked into vertex colors
const LIGHT_DIR: [f32; 3] = [0.3, 0.4, 1.0];
const AMBIENT: f32 = 0.35;

/// Render `actors` to a square PNG of `size` pixels
pub fn render_to_png(actors: &[StreamlineActor], output: &Path, size: u32) -> anyhow::Result<()> {
    let bounds = actors
        .iter()
        .filter_map(|a| a.mesh.bounds())
        .reduce(|(amin, amax), (bmin, bmax)| {
            (
                [amin[0].min(bmin[0]), amin[1].min(bmin[1]), amin[2].min(bmin[2])],
                [amax[0].max(bmax[0]), amax[1].max(bmax[1]), amax[2].max(bmax[2])],
            )
        })
        .ok_or_else(|| anyhow::anyhow!("Nothing to render: no streamline tubes were built"))?;

    let context = HeadlessContext::new()
        .map_err(|e| anyhow::anyhow!("Failed to create an offscreen GL context: {}", e))?;

    let diag = vec3(
        bounds.1[0] - bounds.0[0],
        bounds.1[1] - bounds.0[1],
        bounds.1[2] - bounds.0[2],
    )
    .magnitude()
    .max(1.0);

    let mut camera = Camera::new_perspective(
        Viewport::new_at_origo(size, size),
        vec3(0.0, 0.0, diag * 2.0),
        vec3(0.0, 0.0, 0.0),
        vec3(0.0, 1.0, 0.0),
        degrees(45.0),
        diag * 0.01,
        diag * 10.0,
    );
    auto_fit_camera(bounds, &mut camera);

    let renderables: Vec<Gm<Mesh, ColorMaterial>> = actors
        .iter()
        .filter(|a| !a.mesh.is_empty())
        .map(|actor| {
            let color = [actor.color.red, actor.color.green, actor.color.blue];
            let cpu_mesh = to_cpu_mesh(&actor.mesh, color);
            Gm::new(Mesh::new(&context, &cpu_mesh), material(actor.alpha))
        })
        .collect();
    info!("Rendering {} streamline objects to {}", renderables.len(), output.display());

    let mut color_texture = Texture2D::new_empty::<[u8; 4]>(
        &context,
        size,
        size,
        Interpolation::Nearest,
        Interpolation::Nearest,
        None,
        Wrapping::ClampToEdge,
        Wrapping::ClampToEdge,
    );
    let mut depth_texture =
        DepthTexture2D::new::<f32>(&context, size, size, Wrapping::ClampToEdge, Wrapping::ClampToEdge);

    let pixels: Vec<[u8; 4]> = RenderTarget::new(
        color_texture.as_color_target(None),
        depth_texture.as_depth_target(),
    )
    .clear(ClearState::color_and_depth(0.08, 0.08, 0.12, 1.0, 1.0))
    .render(&camera, &renderables, &[])
    .read_color();

    save_png(pixels, size, size, output)?;
    info!("Saved {}", output.display());
    Ok(())
}

/// Write GL pixels (rows starting at the bottom) as a PNG
fn save_png(pixels: Vec<[u8; 4]>, width: u32, height: u32, output: &Path) -> anyhow::Result<()> {
    let flat: Vec<u8> = pixels.into_iter().flatten().collect();
    let mut img = image::RgbaImage::from_raw(width, height, flat)
        .ok_or_else(|| anyhow::anyhow!("Framebuffer size did not match {}x{}", width, height))?;
    image::imageops::flip_vertical_in_place(&mut img);
    img.save(output)
        .with_context(|| format!("Failed to save {}", output.display()))?;
    Ok(())
}

fn material(alpha: f32) -> ColorMaterial {
    if alpha >= 1.0 {
        return ColorMaterial::default();
    }

    ColorMaterial {
        color: Srgba::new(255, 255, 255, (alpha.clamp(0.0, 1.0) * 255.0) as u8),
        is_transparent: true,
        render_states: RenderStates {
            write_mask: WriteMask::COLOR,
            blend: Blend::TRANSPARENCY,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Upload-ready mesh with simple headlight shading in the vertex colors
fn to_cpu_mesh(mesh: &TubeMesh, color: [u8; 3]) -> CpuMesh {
    let light = vec3(LIGHT_DIR[0], LIGHT_DIR[1], LIGHT_DIR[2]).normalize();

    let colors = mesh
        .normals
        .iter()
        .map(|n| {
            let diffuse = to_vec3(*n).dot(light).max(0.0);
            let shade = AMBIENT + (1.0 - AMBIENT) * diffuse;
            Srgba::new(
                (color[0] as f32 * shade) as u8,
                (color[1] as f32 * shade) as u8,
                (color[2] as f32 * shade) as u8,
                255,
            )
        })
        .collect();

    CpuMesh {
        positions: Positions::F32(mesh.positions.iter().copied().map(to_vec3).collect()),
        indices: Indices::U32(mesh.indices.clone()),
        normals: Some(mesh.normals.iter().copied().map(to_vec3).collect()),
        colors: Some(colors),
        ..Default::default()
    }
}

fn to_vec3(p: Point3) -> Vec3 {
    vec3(p[0], p[1], p[2])
}

/// Position the camera so the whole bounding box is visible
fn auto_fit_camera(bounds: (Point3, Point3), camera: &mut Camera) {
    let (min, max) = bounds;

    let center = vec3(
        (min[0] + max[0]) * 0.5,
        (min[1] + max[1]) * 0.5,
        (min[2] + max[2]) * 0.5,
    );

    let extent = vec3(max[0] - min[0], max[1] - min[1], max[2] - min[2]);
    let diag = extent.magnitude().max(1.0);

    let distance = diag * 1.2;
    let offset = vec3(0.3, 0.4, 1.0).normalize() * distance;

    camera.set_view(center + offset, center, vec3(0.0, 1.0, 0.0));
}
