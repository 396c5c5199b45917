//! The resource library.
//!
//! One id-indexed store for everything a render needs: config, camera,
//! shaders, textures, materials, meshes, and the acceleration structures
//! built over them. Slot 0 of every id space is reserved so that id 0 can
//! mean "none". The library is only mutated while the scene loads; the
//! engine then takes the camera out for the dispatcher and freezes the
//! rest behind an `Arc` for the workers, so no locking is needed
//! anywhere. (The output image never enters the library; it belongs to
//! the dispatcher from the moment it is allocated.)

use std::collections::HashMap;

use pyre_core::{Config, Material, Mesh};

use crate::bvh::{Bvh, Visit};
use crate::camera::Camera;
use crate::ray::{FatRay, HitRecord};
use crate::shader::{Shader, TextureResource};

fn store_slot<T>(slots: &mut Vec<Option<T>>, id: u32, value: T) {
    debug_assert!(id > 0, "id 0 is reserved");
    if id == 0 {
        return;
    }
    let id = id as usize;
    if id >= slots.len() {
        slots.resize_with(id + 1, || None);
    }
    slots[id] = Some(value);
}

fn lookup_slot<T>(slots: &[Option<T>], id: u32) -> Option<&T> {
    slots.get(id as usize).and_then(|slot| slot.as_ref())
}

#[derive(Default)]
pub struct Library {
    config: Option<Config>,
    camera: Option<Camera>,

    shaders: Vec<Option<Shader>>,
    textures: Vec<Option<TextureResource>>,
    materials: Vec<Option<Material>>,
    meshes: Vec<Option<Mesh>>,

    /// Per-mesh triangle BVHs, in the mesh id space
    accels: Vec<Option<Bvh>>,

    /// Top-level BVH over mesh extents
    mbvh: Option<Bvh>,

    material_name_index: HashMap<String, u32>,
    emissive_index: Vec<u32>,
}

impl Library {
    pub fn new() -> Self {
        Self {
            // ID #0 is always reserved.
            shaders: vec![None],
            textures: vec![None],
            materials: vec![None],
            meshes: vec![None],
            accels: vec![None],
            ..Default::default()
        }
    }

    // Configs...
    pub fn store_config(&mut self, config: Config) {
        self.config = Some(config);
    }

    pub fn lookup_config(&self) -> Option<&Config> {
        self.config.as_ref()
    }

    // Cameras...
    pub fn store_camera(&mut self, camera: Camera) {
        self.camera = Some(camera);
    }

    /// Move the camera out for the dispatcher thread.
    pub fn take_camera(&mut self) -> Option<Camera> {
        self.camera.take()
    }

    // Shaders...
    pub fn next_shader_id(&self) -> u32 {
        self.shaders.len() as u32
    }

    pub fn store_shader(&mut self, id: u32, shader: Shader) {
        store_slot(&mut self.shaders, id, shader);
    }

    pub fn lookup_shader(&self, id: u32) -> Option<&Shader> {
        lookup_slot(&self.shaders, id)
    }

    pub fn lookup_shader_mut(&mut self, id: u32) -> Option<&mut Shader> {
        self.shaders.get_mut(id as usize).and_then(|slot| slot.as_mut())
    }

    // Textures...
    pub fn next_texture_id(&self) -> u32 {
        self.textures.len() as u32
    }

    pub fn store_texture(&mut self, id: u32, texture: TextureResource) {
        store_slot(&mut self.textures, id, texture);
    }

    pub fn lookup_texture(&self, id: u32) -> Option<&TextureResource> {
        lookup_slot(&self.textures, id)
    }

    pub fn lookup_texture_mut(&mut self, id: u32) -> Option<&mut TextureResource> {
        self.textures.get_mut(id as usize).and_then(|slot| slot.as_mut())
    }

    // Materials...
    pub fn next_material_id(&self) -> u32 {
        self.materials.len() as u32
    }

    pub fn store_material(&mut self, id: u32, material: Material, name: &str) {
        store_slot(&mut self.materials, id, material);
        self.material_name_index.insert(name.to_string(), id);
    }

    pub fn lookup_material(&self, id: u32) -> Option<&Material> {
        lookup_slot(&self.materials, id)
    }

    /// Material id by name, 0 on miss.
    pub fn lookup_material_id(&self, name: &str) -> u32 {
        self.material_name_index.get(name).copied().unwrap_or(0)
    }

    // Meshes...
    pub fn next_mesh_id(&self) -> u32 {
        self.meshes.len() as u32
    }

    pub fn store_mesh(&mut self, id: u32, mut mesh: Mesh) {
        mesh.id = id;

        let material = self.lookup_material(mesh.material);
        debug_assert!(material.is_some(), "mesh stored before its material");
        if material.map_or(false, |mat| mat.emissive) {
            self.emissive_index.push(id);
        }

        store_slot(&mut self.meshes, id, mesh);
    }

    pub fn lookup_mesh(&self, id: u32) -> Option<&Mesh> {
        lookup_slot(&self.meshes, id)
    }

    /// Visit every stored mesh, skipping holes, starting at id 1.
    pub fn for_each_mesh(&self, mut func: impl FnMut(u32, &Mesh)) {
        for id in 1..self.meshes.len() {
            if let Some(mesh) = &self.meshes[id] {
                func(id as u32, mesh);
            }
        }
    }

    /// Ids of meshes whose material is emissive.
    pub fn emissive_meshes(&self) -> &[u32] {
        &self.emissive_index
    }

    // Acceleration structures...
    pub fn store_accel(&mut self, id: u32, bvh: Bvh) {
        store_slot(&mut self.accels, id, bvh);
    }

    pub fn lookup_accel(&self, id: u32) -> Option<&Bvh> {
        lookup_slot(&self.accels, id)
    }

    pub fn store_mbvh(&mut self, bvh: Bvh) {
        self.mbvh = Some(bvh);
    }

    pub fn lookup_mbvh(&self) -> Option<&Bvh> {
        self.mbvh.as_ref()
    }

    /// Intersect a ray against the scene through the two-level BVH: the
    /// top-level tree culls meshes, and each surviving mesh is traversed
    /// in its own object space. On a hit, the ray's hit record is updated
    /// and the interpolated normal is corrected into world space with the
    /// mesh's inverse-transpose transform.
    pub fn intersect(&self, ray: &mut FatRay, me: u32) -> bool {
        let mbvh = self
            .lookup_mbvh()
            .expect("spatial index queried before it was built");

        let slim = ray.slim;
        let mut nearest = HitRecord {
            t: ray.hit.t,
            ..HitRecord::default()
        };

        mbvh.traverse(&slim, &mut nearest, |mesh_id, world_ray, hit| {
            let (Some(mesh), Some(accel)) = (self.lookup_mesh(mesh_id), self.lookup_accel(mesh_id))
            else {
                debug_assert!(false, "top-level BVH references mesh {mesh_id} without accel");
                return Visit::default();
            };

            // Traverse the mesh's own tree with the ray in object space.
            // The direction is not renormalized, so t stays commensurable
            // with the world-space hit record.
            let object_ray = world_ray.transformed(&mesh.xform_inv);
            let state = accel.traverse(&object_ray, hit, |face, r, hit| {
                match mesh.intersect_face(face as usize, r) {
                    Some((t, geom)) if t < hit.t => {
                        hit.worker = me;
                        hit.mesh = mesh_id;
                        hit.t = t;
                        hit.geom = geom;
                        Visit {
                            hit: true,
                            suspend: false,
                        }
                    }
                    _ => Visit::default(),
                }
            });

            Visit {
                hit: state.hit,
                suspend: false,
            }
        });

        if nearest.worker == 0 {
            return false;
        }

        ray.hit = nearest;
        if let Some(mesh) = self.lookup_mesh(nearest.mesh) {
            ray.hit.geom.n = mesh
                .xform_inv_tr
                .transform_vector3(ray.hit.geom.n)
                .normalize();
        }
        true
    }

    /// Brute-force reference intersection over every triangle of every
    /// mesh; the accelerated path must agree with this.
    pub fn naive_intersect(&self, ray: &mut FatRay, me: u32) -> bool {
        let mut nearest = HitRecord {
            t: ray.hit.t,
            ..HitRecord::default()
        };

        for id in 1..self.meshes.len() as u32 {
            let Some(mesh) = self.lookup_mesh(id) else {
                continue;
            };

            let object_ray = ray.slim.transformed(&mesh.xform_inv);
            for face in 0..mesh.triangle_count() {
                if let Some((t, geom)) = mesh.intersect_face(face, &object_ray) {
                    if t < nearest.t {
                        nearest = HitRecord {
                            worker: me,
                            mesh: id,
                            t,
                            geom,
                        };
                    }
                }
            }
        }

        if nearest.worker == 0 {
            return false;
        }

        ray.hit = nearest;
        if let Some(mesh) = self.lookup_mesh(nearest.mesh) {
            ray.hit.geom.n = mesh
                .xform_inv_tr
                .transform_vector3(ray.hit.geom.n)
                .normalize();
        }
        true
    }
}
