//! Bounding volume hierarchy.
//!
//! Construction follows the SAH-bucketed recursive partition from
//! Physically Based Rendering (section 4.4), with the linked tree
//! flattened into a linear array for portable traversal. Traversal is the
//! stackless scheme of Hapala et al. [2011], extended so that a traversal
//! can be suspended at a leaf-visit boundary, shipped to another worker
//! as a small state packet, and resumed there without restarting.
//!
//! Two flavors of tree are built over the same node type: a per-mesh BVH
//! over triangles, and a top-level BVH over whole meshes keyed by their
//! resource ids.

use pyre_core::Mesh;
use pyre_math::{Aabb, Interval, SlimRay, Vec3};

use crate::ray::HitRecord;

/// Number of candidate split buckets considered per node.
const NUM_BUCKETS: usize = 12;

/// One node of the flattened tree.
///
/// The left child of node `i` is always node `i + 1`; the right child is
/// linked explicitly, as is the parent (the root is its own parent).
/// Leaves have `num_prims > 0` and reference a contiguous range of the
/// primitive id array; inner nodes have `num_prims == 0` and a valid
/// split axis.
#[derive(Clone, Debug)]
pub struct LinearNode {
    pub bounds: Aabb,
    pub parent: u32,
    pub right: u32,
    pub axis: u8,
    pub first_prim: u32,
    pub num_prims: u32,
}

impl LinearNode {
    pub fn is_leaf(&self) -> bool {
        self.num_prims > 0
    }
}

/// Which edge the traversal followed to arrive at the current node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FromDirection {
    Parent,
    Sibling,
    Child,
}

/// Portable snapshot of a traversal, sufficient to resume it without
/// re-visiting finished subtrees. Resuming with the stored state on the
/// same BVH yields the same ordering of leaf visits that would have
/// occurred without suspension.
#[derive(Clone, Copy, Debug)]
pub struct TraversalState {
    pub current: u32,
    pub from: FromDirection,

    /// Whether any intersector call has reported a hit so far
    pub hit: bool,

    /// Best hit distance so far, mirroring the hit record at suspension
    pub t: f32,
}

impl TraversalState {
    /// The state a traversal starts from: at the root, as if arriving
    /// from its parent.
    pub fn fresh() -> Self {
        Self {
            current: 0,
            from: FromDirection::Parent,
            hit: false,
            t: f32::INFINITY,
        }
    }

    /// True once the traversal has stepped past the root on the way up.
    pub fn is_complete(&self) -> bool {
        self.current == 0 && self.from == FromDirection::Child
    }
}

/// Outcome of one primitive intersector call.
#[derive(Clone, Copy, Debug, Default)]
pub struct Visit {
    /// The intersector recorded a hit in the hit record
    pub hit: bool,

    /// Ask the traversal to suspend once the current leaf is finished
    pub suspend: bool,
}

struct PrimInfo {
    id: u32,
    bounds: Aabb,
    centroid: Vec3,
}

struct LinkedNode {
    bounds: Aabb,
    axis: u8,
    first_prim: u32,
    num_prims: u32,
    children: Option<(Box<LinkedNode>, Box<LinkedNode>)>,
}

fn axis_component(v: Vec3, axis: u8) -> f32 {
    match axis {
        0 => v.x,
        1 => v.y,
        _ => v.z,
    }
}

/// A flattened, stackless-traversable bounding volume hierarchy.
pub struct Bvh {
    nodes: Vec<LinearNode>,
    prim_ids: Vec<u32>,
}

impl Bvh {
    /// Build a BVH over the triangles of a mesh, in object space.
    /// Primitive ids are face indices.
    pub fn from_mesh(mesh: &Mesh) -> Bvh {
        let prims = (0..mesh.triangle_count())
            .map(|face| {
                let mut bounds = mesh.face_bounds(face);
                bounds.pad_to_minimums();
                PrimInfo {
                    id: face as u32,
                    bounds,
                    centroid: mesh.face_centroid(face),
                }
            })
            .collect();
        Self::build(prims)
    }

    /// Build a top-level BVH over a set of things, where the things are
    /// pairs of resource ids and their bounding boxes.
    pub fn from_extents(things: &[(u32, Aabb)]) -> Bvh {
        let prims = things
            .iter()
            .map(|&(id, bounds)| {
                let mut bounds = bounds;
                bounds.pad_to_minimums();
                PrimInfo {
                    id,
                    bounds,
                    centroid: bounds.centroid(),
                }
            })
            .collect();
        Self::build(prims)
    }

    /// The extents of the area contained by the BVH.
    pub fn extents(&self) -> Aabb {
        self.nodes[0].bounds
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[LinearNode] {
        &self.nodes
    }

    pub fn prim_ids(&self) -> &[u32] {
        &self.prim_ids
    }

    /// Traverse from the root, testing the ray against the bounding
    /// volumes and invoking the intersector at every leaf primitive.
    /// Returns the final traversal state; when the intersector requested
    /// suspension the state is incomplete and can be handed to
    /// [`Bvh::resume`], possibly on another worker.
    pub fn traverse<F>(&self, ray: &SlimRay, nearest: &mut HitRecord, intersector: F) -> TraversalState
    where
        F: FnMut(u32, &SlimRay, &mut HitRecord) -> Visit,
    {
        self.resume(TraversalState::fresh(), ray, nearest, intersector)
    }

    /// Continue a traversal from a saved state packet.
    pub fn resume<F>(
        &self,
        state: TraversalState,
        ray: &SlimRay,
        nearest: &mut HitRecord,
        mut intersector: F,
    ) -> TraversalState
    where
        F: FnMut(u32, &SlimRay, &mut HitRecord) -> Visit,
    {
        let mut current = state.current as usize;
        let mut from = state.from;
        let mut hit_any = state.hit;

        loop {
            match from {
                FromDirection::Child => {
                    // Finished the subtree under `current`; go sideways to
                    // the far sibling if we were the near child, otherwise
                    // up. Stepping past the root terminates.
                    if current == 0 {
                        break;
                    }
                    let parent = self.nodes[current].parent as usize;
                    if current == self.near_child(parent, ray.direction) {
                        current = self.sibling(current);
                        from = FromDirection::Sibling;
                    } else {
                        current = parent;
                    }
                }

                FromDirection::Parent | FromDirection::Sibling => {
                    let node = &self.nodes[current];
                    let overlaps = node.bounds.hit(ray, Interval::new(0.0, nearest.t));

                    if overlaps && !node.is_leaf() {
                        current = self.near_child(current, ray.direction);
                        from = FromDirection::Parent;
                        continue;
                    }

                    let mut suspend = false;
                    if overlaps {
                        let first = node.first_prim as usize;
                        let count = node.num_prims as usize;
                        for &prim in &self.prim_ids[first..first + count] {
                            let visit = intersector(prim, ray, nearest);
                            hit_any |= visit.hit;
                            suspend |= visit.suspend;
                        }
                    }

                    // Done with this subtree (missed, or a finished leaf)
                    if from == FromDirection::Parent {
                        if current == 0 {
                            from = FromDirection::Child;
                            break;
                        }
                        current = self.sibling(current);
                        from = FromDirection::Sibling;
                    } else {
                        current = self.nodes[current].parent as usize;
                        from = FromDirection::Child;
                    }

                    if suspend {
                        return TraversalState {
                            current: current as u32,
                            from,
                            hit: hit_any,
                            t: nearest.t,
                        };
                    }
                }
            }
        }

        TraversalState {
            current: 0,
            from: FromDirection::Child,
            hit: hit_any,
            t: nearest.t,
        }
    }

    /// The other child of the current node's parent.
    fn sibling(&self, current: usize) -> usize {
        let parent = self.nodes[current].parent as usize;
        let right = self.nodes[parent].right as usize;
        if right == current {
            parent + 1
        } else {
            right
        }
    }

    /// The near child is the one entered first, picked by the sign of the
    /// ray direction along the node's split axis.
    fn near_child(&self, current: usize, direction: Vec3) -> usize {
        let node = &self.nodes[current];
        if axis_component(direction, node.axis) < 0.0 {
            node.right as usize
        } else {
            current + 1
        }
    }

    fn build(mut prims: Vec<PrimInfo>) -> Bvh {
        match prims.len() {
            0 => Self::zero_things(),
            1 => Self::one_thing(&prims[0]),
            n => {
                let root = Self::recursive_build(&mut prims, 0, n);
                let prim_ids = prims.iter().map(|p| p.id).collect();
                let mut nodes = Vec::new();
                Self::flatten(&root, 0, &mut nodes);
                Bvh { nodes, prim_ids }
            }
        }
    }

    /// Special case: a tree with nothing in it. The single root has
    /// invalid bounds, so every ray misses.
    fn zero_things() -> Bvh {
        Bvh {
            nodes: vec![LinearNode {
                bounds: Aabb::EMPTY,
                parent: 0,
                right: 0,
                axis: 0,
                first_prim: 0,
                num_prims: 0,
            }],
            prim_ids: Vec::new(),
        }
    }

    /// Special case: a tree with one thing in it, a lone root leaf.
    fn one_thing(prim: &PrimInfo) -> Bvh {
        Bvh {
            nodes: vec![LinearNode {
                bounds: prim.bounds,
                parent: 0,
                right: 0,
                axis: 0,
                first_prim: 0,
                num_prims: 1,
            }],
            prim_ids: vec![prim.id],
        }
    }

    /// Recursively partition `prims[start..end]`, reordering the slice in
    /// place so leaves reference contiguous ranges of it.
    fn recursive_build(prims: &mut Vec<PrimInfo>, start: usize, end: usize) -> LinkedNode {
        let n = end - start;

        let mut bounds = Aabb::EMPTY;
        let mut centroid_bounds = Aabb::EMPTY;
        for prim in &prims[start..end] {
            bounds = Aabb::surrounding(&bounds, &prim.bounds);
            centroid_bounds.grow(prim.centroid);
        }

        let axis = centroid_bounds.longest_axis() as u8;
        let cmin = axis_component(centroid_bounds.min(), axis);
        let extent = axis_component(centroid_bounds.max(), axis) - cmin;

        let leaf = |first: usize, count: usize| LinkedNode {
            bounds,
            axis,
            first_prim: first as u32,
            num_prims: count as u32,
            children: None,
        };

        // Too few primitives, or all centroids coincident
        if n <= 1 || extent <= 1e-8 {
            return leaf(start, n);
        }

        // Bucket the primitives along the axis and cost every candidate
        // split between adjacent buckets.
        let bucket_of = |centroid: Vec3| -> usize {
            let b = ((axis_component(centroid, axis) - cmin) / extent * NUM_BUCKETS as f32) as usize;
            b.min(NUM_BUCKETS - 1)
        };

        let mut counts = [0usize; NUM_BUCKETS];
        let mut bucket_bounds = [Aabb::EMPTY; NUM_BUCKETS];
        for prim in &prims[start..end] {
            let b = bucket_of(prim.centroid);
            counts[b] += 1;
            bucket_bounds[b] = Aabb::surrounding(&bucket_bounds[b], &prim.bounds);
        }

        let parent_area = bounds.surface_area();
        if parent_area <= 0.0 {
            return leaf(start, n);
        }

        let mut best_split = 0;
        let mut best_cost = f32::INFINITY;
        for split in 0..NUM_BUCKETS - 1 {
            let mut left = Aabb::EMPTY;
            let mut right = Aabb::EMPTY;
            let mut left_count = 0usize;
            let mut right_count = 0usize;
            for b in 0..=split {
                left = Aabb::surrounding(&left, &bucket_bounds[b]);
                left_count += counts[b];
            }
            for b in split + 1..NUM_BUCKETS {
                right = Aabb::surrounding(&right, &bucket_bounds[b]);
                right_count += counts[b];
            }
            let cost = 1.0
                + (left_count as f32 * left.surface_area()
                    + right_count as f32 * right.surface_area())
                    / parent_area;
            if cost < best_cost {
                best_cost = cost;
                best_split = split;
            }
        }

        // Splitting must beat the cost of intersecting everything here
        if best_cost >= n as f32 {
            return leaf(start, n);
        }

        // Partition in place around the chosen split
        let mut mid = start;
        for i in start..end {
            if bucket_of(prims[i].centroid) <= best_split {
                prims.swap(i, mid);
                mid += 1;
            }
        }
        if mid == start || mid == end {
            return leaf(start, n);
        }

        let left = Self::recursive_build(prims, start, mid);
        let right = Self::recursive_build(prims, mid, end);
        LinkedNode {
            bounds,
            axis,
            first_prim: 0,
            num_prims: 0,
            children: Some((Box::new(left), Box::new(right))),
        }
    }

    /// Flatten the linked tree depth-first so that the left child of node
    /// `i` lands at `i + 1`, recording parent and right-child offsets.
    fn flatten(node: &LinkedNode, parent: u32, nodes: &mut Vec<LinearNode>) -> u32 {
        let offset = nodes.len() as u32;
        nodes.push(LinearNode {
            bounds: node.bounds,
            parent,
            right: 0,
            axis: node.axis,
            first_prim: node.first_prim,
            num_prims: node.num_prims,
        });

        if let Some((left, right)) = &node.children {
            Self::flatten(left, offset, nodes);
            let right_offset = Self::flatten(right, offset, nodes);
            nodes[offset as usize].right = right_offset;
        }

        offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyre_core::Vertex;
    use pyre_math::{Mat4, Vec2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// A soup of small random triangles in [-1, 1]^3.
    fn random_mesh(count: usize, seed: u64) -> Mesh {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut vertices = Vec::new();
        let mut faces = Vec::new();

        for i in 0..count {
            let base = Vec3::new(
                rng.gen::<f32>() * 2.0 - 1.0,
                rng.gen::<f32>() * 2.0 - 1.0,
                rng.gen::<f32>() * 2.0 - 1.0,
            );
            let e1 = Vec3::new(rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>()) * 0.2;
            let e2 = Vec3::new(rng.gen::<f32>(), rng.gen::<f32>(), rng.gen::<f32>()) * 0.2;

            let v = (i * 3) as u32;
            vertices.push(Vertex::new(base, Vec3::Z, Vec2::ZERO));
            vertices.push(Vertex::new(base + e1, Vec3::Z, Vec2::ZERO));
            vertices.push(Vertex::new(base + e2, Vec3::Z, Vec2::ZERO));
            faces.push([v, v + 1, v + 2]);
        }

        Mesh::new(1, Mat4::IDENTITY, vertices, faces)
    }

    fn random_ray(rng: &mut StdRng) -> SlimRay {
        let origin = Vec3::new(
            rng.gen::<f32>() * 6.0 - 3.0,
            rng.gen::<f32>() * 6.0 - 3.0,
            rng.gen::<f32>() * 6.0 - 3.0,
        );
        let toward = Vec3::new(
            rng.gen::<f32>() * 2.0 - 1.0,
            rng.gen::<f32>() * 2.0 - 1.0,
            rng.gen::<f32>() * 2.0 - 1.0,
        );
        let direction = (toward - origin).normalize_or_zero();
        SlimRay::new(origin, direction)
    }

    /// Intersector over a mesh's faces, updating the shared nearest hit.
    fn mesh_intersector<'a>(
        mesh: &'a Mesh,
    ) -> impl FnMut(u32, &SlimRay, &mut HitRecord) -> Visit + 'a {
        move |prim, ray, hit| match mesh.intersect_face(prim as usize, ray) {
            Some((t, geom)) if t < hit.t => {
                hit.worker = 1;
                hit.mesh = 1;
                hit.t = t;
                hit.geom = geom;
                Visit {
                    hit: true,
                    suspend: false,
                }
            }
            _ => Visit::default(),
        }
    }

    /// Brute-force nearest hit over every face.
    fn naive_nearest(mesh: &Mesh, ray: &SlimRay) -> Option<(f32, usize)> {
        let mut nearest: Option<(f32, usize)> = None;
        for face in 0..mesh.triangle_count() {
            if let Some((t, _)) = mesh.intersect_face(face, ray) {
                if nearest.map_or(true, |(best, _)| t < best) {
                    nearest = Some((t, face));
                }
            }
        }
        nearest
    }

    #[test]
    fn test_zero_things() {
        let bvh = Bvh::from_extents(&[]);
        assert_eq!(bvh.node_count(), 1);
        assert!(!bvh.extents().is_valid());

        let mesh = random_mesh(1, 0);
        let ray = SlimRay::new(Vec3::new(0.0, 0.0, 5.0), Vec3::new(0.0, 0.0, -1.0));
        let mut hit = HitRecord::default();
        let state = bvh.traverse(&ray, &mut hit, mesh_intersector(&mesh));
        assert!(state.is_complete());
        assert!(!state.hit);
    }

    #[test]
    fn test_one_thing() {
        let mesh = random_mesh(1, 7);
        let bvh = Bvh::from_mesh(&mesh);
        assert_eq!(bvh.node_count(), 1);
        assert!(bvh.nodes()[0].is_leaf());

        // Aim straight at the lone triangle's centroid
        let target = mesh.face_centroid(0);
        let origin = target + Vec3::new(0.0, 0.0, 5.0);
        let ray = SlimRay::new(origin, (target - origin).normalize());

        let mut hit = HitRecord::default();
        let state = bvh.traverse(&ray, &mut hit, mesh_intersector(&mesh));
        assert!(state.is_complete());
        assert_eq!(state.hit, naive_nearest(&mesh, &ray).is_some());
    }

    #[test]
    fn test_structure_invariants() {
        let mesh = random_mesh(200, 11);
        let bvh = Bvh::from_mesh(&mesh);
        let nodes = bvh.nodes();

        for (i, node) in nodes.iter().enumerate() {
            if i > 0 {
                // Every node is enclosed by its parent
                let parent = &nodes[node.parent as usize];
                assert!(
                    parent.bounds.contains(&node.bounds),
                    "node {} escapes its parent {}",
                    i,
                    node.parent
                );
            }

            if node.is_leaf() {
                // Every referenced primitive is enclosed by the leaf
                let first = node.first_prim as usize;
                for &prim in &bvh.prim_ids()[first..first + node.num_prims as usize] {
                    let prim_bounds = mesh.face_bounds(prim as usize);
                    assert!(node.bounds.contains(&prim_bounds));
                }
            } else {
                // Left child is adjacent; both children link back
                assert_eq!(nodes[i + 1].parent as usize, i);
                assert_eq!(nodes[node.right as usize].parent as usize, i);
                assert!(node.axis < 3);
            }
        }

        // Every primitive appears exactly once
        let mut seen = vec![false; mesh.triangle_count()];
        for &prim in bvh.prim_ids() {
            assert!(!seen[prim as usize]);
            seen[prim as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }

    #[test]
    fn test_matches_naive_intersection() {
        let mesh = random_mesh(1000, 42);
        let bvh = Bvh::from_mesh(&mesh);
        let mut rng = StdRng::seed_from_u64(1337);

        for _ in 0..1000 {
            let ray = random_ray(&mut rng);
            let mut hit = HitRecord::default();
            let state = bvh.traverse(&ray, &mut hit, mesh_intersector(&mesh));
            assert!(state.is_complete());

            match naive_nearest(&mesh, &ray) {
                Some((t, _)) => {
                    assert!(state.hit);
                    assert!(
                        (hit.t - t).abs() < 1e-5,
                        "bvh t {} vs naive t {}",
                        hit.t,
                        t
                    );
                }
                None => assert!(!state.hit, "bvh hit where naive missed"),
            }
        }
    }

    #[test]
    fn test_suspend_resume_equivalence() {
        let mesh = random_mesh(300, 5);
        let bvh = Bvh::from_mesh(&mesh);
        let mut rng = StdRng::seed_from_u64(99);

        for round in 0..100 {
            let ray = random_ray(&mut rng);

            // Baseline: uninterrupted traversal
            let mut baseline_hit = HitRecord::default();
            let baseline = bvh.traverse(&ray, &mut baseline_hit, mesh_intersector(&mesh));

            // Suspend on roughly half of all leaf visits, resuming until done
            let mut hit = HitRecord::default();
            let mut flip = round % 2 == 0;
            let mut state = TraversalState::fresh();
            let mut resumes = 0;
            while !state.is_complete() {
                let mut inner = mesh_intersector(&mesh);
                state = bvh.resume(state, &ray, &mut hit, |prim, r, h| {
                    let mut visit = inner(prim, r, h);
                    flip = !flip;
                    visit.suspend = flip;
                    visit
                });
                resumes += 1;
                assert!(resumes < 10_000, "suspension loop failed to converge");
            }

            assert_eq!(state.hit, baseline.hit);
            if baseline.hit {
                assert!((hit.t - baseline_hit.t).abs() < 1e-6);
                assert_eq!(hit.mesh, baseline_hit.mesh);
            }
        }
    }

    #[test]
    fn test_extents_cover_all_primitives() {
        let mesh = random_mesh(64, 3);
        let bvh = Bvh::from_mesh(&mesh);
        for face in 0..mesh.triangle_count() {
            assert!(bvh.extents().contains(&mesh.face_bounds(face)));
        }
    }

    #[test]
    fn test_top_level_from_extents() {
        let things = vec![
            (3u32, Aabb::from_points(Vec3::ZERO, Vec3::ONE)),
            (7u32, Aabb::from_points(Vec3::new(4.0, 0.0, 0.0), Vec3::new(5.0, 1.0, 1.0))),
        ];
        let bvh = Bvh::from_extents(&things);

        // A ray through the second box reports resource id 7
        let ray = SlimRay::new(Vec3::new(4.5, 0.5, 5.0), Vec3::new(0.0, 0.0, -1.0));
        let mut hit = HitRecord::default();
        let mut seen = Vec::new();
        bvh.traverse(&ray, &mut hit, |id, _, _| {
            seen.push(id);
            Visit::default()
        });
        assert_eq!(seen, vec![7]);
    }
}
