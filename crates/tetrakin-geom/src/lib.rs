//! # TETRAKIN Geometry
//!
//! Geometry index for reaction-diffusion simulation on tetrahedral meshes.
//!
//! Elements live in flat arenas and refer to each other by integer index,
//! with `Option<usize>` standing in for "absent" (boundary faces, missing
//! outer tetrahedra). Compartments group tetrahedra that share a volume
//! system; patches group the triangles separating compartments and carry
//! a well-defined orientation: every patch triangle has a required *inner*
//! tetrahedron and an optional *outer* one.
//!
//! Mesh file import is out of scope; per-element metric data (volumes,
//! face areas, inter-centroid distances) is supplied directly through the
//! builder API, and the [`meshes`] module constructs the small
//! programmatic meshes used by tests and demos.

use serde::{Deserialize, Serialize};
use tetrakin_core::{Area, Length, Result, SimError, Volume};

// =============================================================================
// ELEMENTS
// =============================================================================

/// Tetrahedral element with metric data.
///
/// `neighbours[f]` is the tet across face `f`; `face_areas[f]` and
/// `face_dists[f]` are the shared face area and the distance between the
/// two barycenters. `tri_faces[f]` is the boundary triangle glued onto
/// face `f`, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tetrahedron {
    pub vol: Volume,
    pub face_areas: [Area; 4],
    pub face_dists: [Length; 4],
    pub neighbours: [Option<usize>; 4],
    pub tri_faces: [Option<usize>; 4],
    /// Parent compartment, set on compartment creation
    pub comp: Option<usize>,
}

/// Triangular surface element with metric data.
///
/// `neighbours[e]` is the triangle across edge `e` within the same patch;
/// `edge_dists[e]` is the barycenter-to-barycenter distance across that
/// edge. Orientation: `inner_tet` is required, `outer_tet` optional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Triangle {
    pub area: Area,
    pub edge_lengths: [Length; 3],
    pub edge_dists: [Length; 3],
    pub neighbours: [Option<usize>; 3],
    pub inner_tet: usize,
    pub outer_tet: Option<usize>,
    /// Parent patch, set on patch creation
    pub patch: Option<usize>,
}

// =============================================================================
// COMPARTMENTS AND PATCHES
// =============================================================================

/// Geometry carried by a compartment.
///
/// The tet-ODE solver only accepts the `Mesh` variant; a well-mixed
/// compartment is refused at setup with InvalidGeometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompGeometry {
    WellMixed { volume: Volume },
    Mesh { tets: Vec<usize> },
}

/// A set of tetrahedra sharing volume systems
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compartment {
    pub name: String,
    /// Attached volume system names, resolved at solver setup
    pub vsys: Vec<String>,
    pub geometry: CompGeometry,
}

/// A set of triangles sharing surface systems, with an oriented
/// inner compartment (required) and outer compartment (optional)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patch {
    pub name: String,
    /// Attached surface system names, resolved at solver setup
    pub ssys: Vec<String>,
    pub tris: Vec<usize>,
    pub inner: String,
    pub outer: Option<String>,
}

// =============================================================================
// MESH
// =============================================================================

/// Element arena plus compartment/patch grouping.
///
/// Builder methods validate indices and metric signs as elements are
/// added; cross-element consistency (e.g. that linked faces agree on
/// their shared area) is the caller's responsibility, since metric data
/// is taken at face value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Mesh {
    tets: Vec<Tetrahedron>,
    tris: Vec<Triangle>,
    comps: Vec<Compartment>,
    patches: Vec<Patch>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tetrahedron with its metric data
    pub fn add_tet(
        &mut self,
        vol: Volume,
        face_areas: [Area; 4],
        face_dists: [Length; 4],
    ) -> Result<usize> {
        if vol <= 0.0 {
            return Err(SimError::ArgumentOutOfRange(format!(
                "non-positive tet volume {}",
                vol
            )));
        }
        if face_areas.iter().any(|&a| a <= 0.0) || face_dists.iter().any(|&d| d <= 0.0) {
            return Err(SimError::ArgumentOutOfRange(
                "non-positive tet face metric".into(),
            ));
        }
        self.tets.push(Tetrahedron {
            vol,
            face_areas,
            face_dists,
            neighbours: [None; 4],
            tri_faces: [None; 4],
            comp: None,
        });
        Ok(self.tets.len() - 1)
    }

    /// Make two tetrahedra neighbours across the given faces
    pub fn link_tets(&mut self, a: usize, face_a: usize, b: usize, face_b: usize) -> Result<()> {
        self.check_tet(a)?;
        self.check_tet(b)?;
        if face_a >= 4 || face_b >= 4 {
            return Err(SimError::ArgumentOutOfRange("tet face index > 3".into()));
        }
        self.tets[a].neighbours[face_a] = Some(b);
        self.tets[b].neighbours[face_b] = Some(a);
        Ok(())
    }

    /// Add a surface triangle with its metric data and oriented adjacency
    pub fn add_tri(
        &mut self,
        area: Area,
        edge_lengths: [Length; 3],
        edge_dists: [Length; 3],
        inner_tet: usize,
        outer_tet: Option<usize>,
    ) -> Result<usize> {
        if area <= 0.0 {
            return Err(SimError::ArgumentOutOfRange(format!(
                "non-positive triangle area {}",
                area
            )));
        }
        if edge_lengths.iter().any(|&l| l <= 0.0) || edge_dists.iter().any(|&d| d <= 0.0) {
            return Err(SimError::ArgumentOutOfRange(
                "non-positive triangle edge metric".into(),
            ));
        }
        self.check_tet(inner_tet)?;
        if let Some(t) = outer_tet {
            self.check_tet(t)?;
        }
        self.tris.push(Triangle {
            area,
            edge_lengths,
            edge_dists,
            neighbours: [None; 3],
            inner_tet,
            outer_tet,
            patch: None,
        });
        Ok(self.tris.len() - 1)
    }

    /// Make two triangles neighbours across the given edges
    pub fn link_tris(&mut self, a: usize, edge_a: usize, b: usize, edge_b: usize) -> Result<()> {
        self.check_tri(a)?;
        self.check_tri(b)?;
        if edge_a >= 3 || edge_b >= 3 {
            return Err(SimError::ArgumentOutOfRange("triangle edge index > 2".into()));
        }
        self.tris[a].neighbours[edge_a] = Some(b);
        self.tris[b].neighbours[edge_b] = Some(a);
        Ok(())
    }

    /// Glue a triangle onto a tetrahedron face
    pub fn attach_tri(&mut self, tet: usize, face: usize, tri: usize) -> Result<()> {
        self.check_tet(tet)?;
        self.check_tri(tri)?;
        if face >= 4 {
            return Err(SimError::ArgumentOutOfRange("tet face index > 3".into()));
        }
        self.tets[tet].tri_faces[face] = Some(tri);
        Ok(())
    }

    /// Create a compartment over the given geometry, attaching volume
    /// systems by name. Mesh-variant tets must not already belong to
    /// another compartment.
    pub fn add_compartment(
        &mut self,
        name: &str,
        vsys: &[&str],
        geometry: CompGeometry,
    ) -> Result<usize> {
        if self.comps.iter().any(|c| c.name == name) {
            return Err(SimError::NameConflict(format!(
                "compartment '{}' already exists",
                name
            )));
        }
        let cidx = self.comps.len();
        match &geometry {
            CompGeometry::WellMixed { volume } => {
                if *volume <= 0.0 {
                    return Err(SimError::ArgumentOutOfRange(
                        "non-positive compartment volume".into(),
                    ));
                }
            }
            CompGeometry::Mesh { tets } => {
                for &t in tets {
                    self.check_tet(t)?;
                    if self.tets[t].comp.is_some() {
                        return Err(SimError::ArgumentOutOfRange(format!(
                            "tet {} already assigned to a compartment",
                            t
                        )));
                    }
                }
                for &t in tets {
                    self.tets[t].comp = Some(cidx);
                }
            }
        }
        self.comps.push(Compartment {
            name: name.to_string(),
            vsys: vsys.iter().map(|s| s.to_string()).collect(),
            geometry,
        });
        Ok(cidx)
    }

    /// Create a patch over the given triangles, attaching surface systems
    /// by name. The inner compartment is required, the outer optional.
    pub fn add_patch(
        &mut self,
        name: &str,
        ssys: &[&str],
        tris: &[usize],
        inner: &str,
        outer: Option<&str>,
    ) -> Result<usize> {
        if self.patches.iter().any(|p| p.name == name) {
            return Err(SimError::NameConflict(format!(
                "patch '{}' already exists",
                name
            )));
        }
        if self.compartment(inner).is_none() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "unknown inner compartment '{}'",
                inner
            )));
        }
        if let Some(o) = outer {
            if self.compartment(o).is_none() {
                return Err(SimError::ArgumentOutOfRange(format!(
                    "unknown outer compartment '{}'",
                    o
                )));
            }
        }
        let pidx = self.patches.len();
        for &t in tris {
            self.check_tri(t)?;
            if self.tris[t].patch.is_some() {
                return Err(SimError::ArgumentOutOfRange(format!(
                    "triangle {} already assigned to a patch",
                    t
                )));
            }
        }
        for &t in tris {
            self.tris[t].patch = Some(pidx);
        }
        self.patches.push(Patch {
            name: name.to_string(),
            ssys: ssys.iter().map(|s| s.to_string()).collect(),
            tris: tris.to_vec(),
            inner: inner.to_string(),
            outer: outer.map(|s| s.to_string()),
        });
        Ok(pidx)
    }

    pub fn tets(&self) -> &[Tetrahedron] {
        &self.tets
    }

    pub fn tris(&self) -> &[Triangle] {
        &self.tris
    }

    pub fn compartments(&self) -> &[Compartment] {
        &self.comps
    }

    pub fn patches(&self) -> &[Patch] {
        &self.patches
    }

    pub fn tet(&self, idx: usize) -> Result<&Tetrahedron> {
        self.tets
            .get(idx)
            .ok_or_else(|| SimError::ArgumentOutOfRange(format!("tet index {} out of range", idx)))
    }

    pub fn tri(&self, idx: usize) -> Result<&Triangle> {
        self.tris
            .get(idx)
            .ok_or_else(|| SimError::ArgumentOutOfRange(format!("tri index {} out of range", idx)))
    }

    /// Look up a compartment by name
    pub fn compartment(&self, name: &str) -> Option<(usize, &Compartment)> {
        self.comps
            .iter()
            .enumerate()
            .find(|(_, c)| c.name == name)
    }

    /// Look up a patch by name
    pub fn patch(&self, name: &str) -> Option<(usize, &Patch)> {
        self.patches
            .iter()
            .enumerate()
            .find(|(_, p)| p.name == name)
    }

    /// Total volume of a compartment
    pub fn comp_volume(&self, comp: &Compartment) -> Volume {
        match &comp.geometry {
            CompGeometry::WellMixed { volume } => *volume,
            CompGeometry::Mesh { tets } => tets.iter().map(|&t| self.tets[t].vol).sum(),
        }
    }

    /// Total area of a patch
    pub fn patch_area(&self, patch: &Patch) -> Area {
        patch.tris.iter().map(|&t| self.tris[t].area).sum()
    }

    fn check_tet(&self, idx: usize) -> Result<()> {
        if idx >= self.tets.len() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "tet index {} out of range",
                idx
            )));
        }
        Ok(())
    }

    fn check_tri(&self, idx: usize) -> Result<()> {
        if idx >= self.tris.len() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "tri index {} out of range",
                idx
            )));
        }
        Ok(())
    }
}

// =============================================================================
// STANDARD MESHES
// =============================================================================

pub mod meshes {
    use super::*;

    /// Metrics of a regular tetrahedron of volume `vol`:
    /// (face area, barycenter-to-barycenter distance across a face).
    fn regular_tet_metrics(vol: Volume) -> (Area, Length) {
        let edge = (6.0 * std::f64::consts::SQRT_2 * vol).cbrt();
        let face_area = 3.0_f64.sqrt() / 4.0 * edge * edge;
        // Barycenter to face is edge/(2*sqrt(6)); mirrored across the face
        let dist = edge / 6.0_f64.sqrt();
        (face_area, dist)
    }

    /// Metrics of an equilateral triangle of area `area`:
    /// (edge length, barycenter-to-barycenter distance across an edge).
    fn equilateral_tri_metrics(area: Area) -> (Length, Length) {
        let edge = (4.0 * area / 3.0_f64.sqrt()).sqrt();
        let dist = edge / 3.0_f64.sqrt();
        (edge, dist)
    }

    /// One regular tet in compartment "cyto" with volume system "vsys"
    pub fn single_tet(vol: Volume) -> Mesh {
        let mut mesh = Mesh::new();
        let (a, d) = regular_tet_metrics(vol);
        let t = mesh.add_tet(vol, [a; 4], [d; 4]).unwrap();
        mesh.add_compartment("cyto", &["vsys"], CompGeometry::Mesh { tets: vec![t] })
            .unwrap();
        mesh
    }

    /// Chain of `n` tets in one compartment "cyto" (vsys "vsys").
    ///
    /// Tet i is linked to tet i+1 through face 1 / face 0 with the given
    /// shared face area and barycenter distance.
    pub fn tet_chain(n: usize, vol: Volume, area: Area, dist: Length) -> Mesh {
        let mut mesh = Mesh::new();
        let tets: Vec<usize> = (0..n)
            .map(|_| mesh.add_tet(vol, [area; 4], [dist; 4]).unwrap())
            .collect();
        for w in tets.windows(2) {
            mesh.link_tets(w[0], 1, w[1], 0).unwrap();
        }
        mesh.add_compartment("cyto", &["vsys"], CompGeometry::Mesh { tets })
            .unwrap();
        mesh
    }

    /// Chain of `n_a + n_b` tets split into compartments "A" and "B",
    /// both carrying volume system "vsys". The chain is linked across
    /// the compartment boundary, so the split alone blocks diffusion.
    pub fn two_comp_chain(
        n_a: usize,
        n_b: usize,
        vol: Volume,
        area: Area,
        dist: Length,
    ) -> Mesh {
        let mut mesh = Mesh::new();
        let tets: Vec<usize> = (0..n_a + n_b)
            .map(|_| mesh.add_tet(vol, [area; 4], [dist; 4]).unwrap())
            .collect();
        for w in tets.windows(2) {
            mesh.link_tets(w[0], 1, w[1], 0).unwrap();
        }
        mesh.add_compartment(
            "A",
            &["vsys"],
            CompGeometry::Mesh {
                tets: tets[..n_a].to_vec(),
            },
        )
        .unwrap();
        mesh.add_compartment(
            "B",
            &["vsys"],
            CompGeometry::Mesh {
                tets: tets[n_a..].to_vec(),
            },
        )
        .unwrap();
        mesh
    }

    /// Like [`two_comp_chain`] but with a one-triangle patch "memb"
    /// (ssys "ssys") at the interface: inner side A, outer side B.
    pub fn two_comp_patched(
        n_a: usize,
        n_b: usize,
        vol: Volume,
        area: Area,
        dist: Length,
    ) -> Mesh {
        let mut mesh = two_comp_chain(n_a, n_b, vol, area, dist);
        let (elen, edist) = equilateral_tri_metrics(area);
        let tri = mesh
            .add_tri(area, [elen; 3], [edist; 3], n_a - 1, Some(n_a))
            .unwrap();
        mesh.attach_tri(n_a - 1, 1, tri).unwrap();
        mesh.attach_tri(n_a, 0, tri).unwrap();
        mesh.add_patch("memb", &["ssys"], &[tri], "A", Some("B"))
            .unwrap();
        mesh
    }

    /// One tet ("cyto", vsys "vsys") with one boundary triangle of the
    /// given area forming patch "memb" (ssys "ssys"), no outer side.
    pub fn patched_tet(vol: Volume, area: Area) -> Mesh {
        let mut mesh = single_tet(vol);
        let (elen, edist) = equilateral_tri_metrics(area);
        let tri = mesh.add_tri(area, [elen; 3], [edist; 3], 0, None).unwrap();
        mesh.attach_tri(0, 0, tri).unwrap();
        mesh.add_patch("memb", &["ssys"], &[tri], "cyto", None)
            .unwrap();
        mesh
    }

    /// Strip of `n` boundary triangles (patch "memb", ssys "ssys"), each
    /// glued onto its own tet of an unlinked row in "cyto" (vsys "vsys").
    /// Triangle i is linked to triangle i+1 through edge 1 / edge 0.
    pub fn tri_strip(n: usize, vol: Volume, area: Area) -> Mesh {
        let mut mesh = Mesh::new();
        let (fa, fd) = regular_tet_metrics(vol);
        let tets: Vec<usize> = (0..n)
            .map(|_| mesh.add_tet(vol, [fa; 4], [fd; 4]).unwrap())
            .collect();
        mesh.add_compartment("cyto", &["vsys"], CompGeometry::Mesh { tets: tets.clone() })
            .unwrap();
        let (elen, edist) = equilateral_tri_metrics(area);
        let tris: Vec<usize> = tets
            .iter()
            .map(|&t| {
                let tri = mesh.add_tri(area, [elen; 3], [edist; 3], t, None).unwrap();
                mesh.attach_tri(t, 0, tri).unwrap();
                tri
            })
            .collect();
        for w in tris.windows(2) {
            mesh.link_tris(w[0], 1, w[1], 0).unwrap();
        }
        mesh.add_patch("memb", &["ssys"], &tris, "cyto", None)
            .unwrap();
        mesh
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_tet_validation() {
        let mut mesh = Mesh::new();
        assert!(matches!(
            mesh.add_tet(0.0, [1.0; 4], [1.0; 4]),
            Err(SimError::ArgumentOutOfRange(_))
        ));
        assert!(matches!(
            mesh.add_tet(1.0, [1.0, 1.0, -1.0, 1.0], [1.0; 4]),
            Err(SimError::ArgumentOutOfRange(_))
        ));
        assert_eq!(mesh.add_tet(1.0, [1.0; 4], [1.0; 4]).unwrap(), 0);
    }

    #[test]
    fn test_link_tets_symmetric() {
        let mut mesh = Mesh::new();
        let a = mesh.add_tet(1.0, [1.0; 4], [1.0; 4]).unwrap();
        let b = mesh.add_tet(1.0, [1.0; 4], [1.0; 4]).unwrap();
        mesh.link_tets(a, 1, b, 0).unwrap();
        assert_eq!(mesh.tet(a).unwrap().neighbours[1], Some(b));
        assert_eq!(mesh.tet(b).unwrap().neighbours[0], Some(a));
    }

    #[test]
    fn test_compartment_assignment_exclusive() {
        let mut mesh = Mesh::new();
        let t = mesh.add_tet(1.0, [1.0; 4], [1.0; 4]).unwrap();
        mesh.add_compartment("a", &["v"], CompGeometry::Mesh { tets: vec![t] })
            .unwrap();
        assert!(matches!(
            mesh.add_compartment("b", &["v"], CompGeometry::Mesh { tets: vec![t] }),
            Err(SimError::ArgumentOutOfRange(_))
        ));
        assert!(matches!(
            mesh.add_compartment("a", &["v"], CompGeometry::WellMixed { volume: 1.0 }),
            Err(SimError::NameConflict(_))
        ));
    }

    #[test]
    fn test_patch_requires_inner_comp() {
        let mut mesh = Mesh::new();
        let t = mesh.add_tet(1.0, [1.0; 4], [1.0; 4]).unwrap();
        let tri = mesh.add_tri(1.0, [1.0; 3], [1.0; 3], t, None).unwrap();
        assert!(matches!(
            mesh.add_patch("p", &["s"], &[tri], "nope", None),
            Err(SimError::ArgumentOutOfRange(_))
        ));
    }

    #[test]
    fn test_tet_chain_shape() {
        let mesh = meshes::tet_chain(5, 1e-18, 1e-12, 1e-6);
        assert_eq!(mesh.tets().len(), 5);
        assert_eq!(mesh.tet(0).unwrap().neighbours[1], Some(1));
        assert_eq!(mesh.tet(4).unwrap().neighbours[1], None);
        let (_, comp) = mesh.compartment("cyto").unwrap();
        assert!((mesh.comp_volume(comp) - 5e-18).abs() < 1e-30);
    }

    #[test]
    fn test_two_comp_patched_orientation() {
        let mesh = meshes::two_comp_patched(3, 3, 1e-18, 1e-12, 1e-6);
        let (_, patch) = mesh.patch("memb").unwrap();
        assert_eq!(patch.tris.len(), 1);
        let tri = mesh.tri(patch.tris[0]).unwrap();
        assert_eq!(tri.inner_tet, 2);
        assert_eq!(tri.outer_tet, Some(3));
        assert_eq!(patch.inner, "A");
        assert_eq!(patch.outer.as_deref(), Some("B"));
    }

    #[test]
    fn test_tri_strip_neighbours() {
        let mesh = meshes::tri_strip(4, 1e-18, 1e-12);
        assert_eq!(mesh.tris().len(), 4);
        assert_eq!(mesh.tri(0).unwrap().neighbours[1], Some(1));
        assert_eq!(mesh.tri(3).unwrap().neighbours[1], None);
        let (_, patch) = mesh.patch("memb").unwrap();
        assert!((mesh.patch_area(patch) - 4e-12).abs() < 1e-24);
    }

    #[test]
    fn test_regular_tet_metrics_plausible() {
        let mesh = meshes::single_tet(1.6667e-21);
        let tet = mesh.tet(0).unwrap();
        // Edge of a regular tet of ~1.67e-21 m^3 is ~2.6e-7 m
        assert!(tet.face_areas[0] > 1e-15 && tet.face_areas[0] < 1e-13);
        assert!(tet.face_dists[0] > 1e-8 && tet.face_dists[0] < 1e-6);
    }
}
