//! # TETRAKIN Solver
//!
//! Deterministic reaction-diffusion solver on tetrahedral meshes.
//!
//! The solver compiles a biochemical [`Model`] plus a meshed geometry into
//! a dense global state vector of molecule counts and a *process graph*: a
//! precomputed per-slot list of every reaction and diffusion process that
//! contributes to that slot's time derivative. An adaptive embedded
//! Runge-Kutta integrator then advances the state, evaluating dy/dt in
//! O(non-zeros) with no allocation.
//!
//! ## Pipeline
//!
//! 1. **State definition**: global and region-local species indices, slot
//!    layout, compiled reaction/diffusion descriptors
//! 2. **Process graph**: flattened descriptor and process arenas with a
//!    per-slot offset table and a rebind side-table
//! 3. **Rate evaluation**: mass-action with per-element coefficients and
//!    diffusion conductances `A*D/(V*d)` (3D) or `L*D/(A*d)` (2D)
//! 4. **Integration**: Dormand-Prince 5(4) with FSAL, per-component error
//!    weights, and a per-run step budget
//!
//! ## Units
//!
//! The state vector carries molecule counts. Rate constants follow the
//! litres-basis mass-action convention and are rescaled per element at
//! setup (see [`TetOdeSimulation`]).

use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use tetrakin_core::{
    conc_to_count, count_to_conc, Conc, OdeRhs, Result, SimError, Time, AVOGADRO, DEFAULT_ATOL,
    DEFAULT_MAX_STEPS, DEFAULT_RTOL, MAX_ORDER, StateVector,
};
use tetrakin_geom::{CompGeometry, Mesh};
use tetrakin_model::Model;

// =============================================================================
// STATE DEFINITION
// =============================================================================

/// Compiled volume reaction: stoichiometry resolved to compartment-local
/// species indices.
#[derive(Debug, Clone)]
pub struct ReacDef {
    pub name: String,
    pub kcst: f64,
    pub order: u32,
    /// Left-hand multiplicities, length = local species count
    pub lhs: Vec<u32>,
    /// rhs - lhs, length = local species count
    pub upd: Vec<i32>,
}

/// Compiled volume diffusion rule
#[derive(Debug, Clone)]
pub struct DiffDef {
    pub name: String,
    pub dcst: f64,
    /// The one species the rule reads and moves (compartment-local)
    pub lig: usize,
}

/// Compiled surface reaction: three-sided stoichiometry resolved to
/// patch-local (s), inner-compartment-local (i) and outer-compartment-local
/// (o) species indices.
#[derive(Debug, Clone)]
pub struct SReacDef {
    pub name: String,
    pub kcst: f64,
    pub order: u32,
    pub surface_surface: bool,
    /// Volume reactants (if any) sit in the inner volume
    pub inner: bool,
    pub slhs: Vec<u32>,
    pub ilhs: Vec<u32>,
    pub olhs: Vec<u32>,
    pub supd: Vec<i32>,
    pub iupd: Vec<i32>,
    pub oupd: Vec<i32>,
}

/// Compiled surface diffusion rule
#[derive(Debug, Clone)]
pub struct SDiffDef {
    pub name: String,
    pub dcst: f64,
    pub lig: usize,
}

/// Per-compartment slice of the state definition
#[derive(Debug, Clone)]
pub struct CompDef {
    pub name: String,
    /// Local -> global species index
    pub spec_l2g: Vec<usize>,
    /// Global -> local species index
    pub spec_g2l: Vec<Option<usize>>,
    pub reacs: Vec<ReacDef>,
    pub diffs: Vec<DiffDef>,
    /// Local -> global tet index
    pub tets: Vec<usize>,
    pub tet_vols: Vec<f64>,
    pub volume: f64,
    pub slot_base: usize,
}

impl CompDef {
    pub fn n_specs(&self) -> usize {
        self.spec_l2g.len()
    }

    /// State-vector slot of (local tet, local species)
    pub fn slot(&self, tet_local: usize, spec_local: usize) -> usize {
        self.slot_base + tet_local * self.n_specs() + spec_local
    }
}

/// Per-patch slice of the state definition
#[derive(Debug, Clone)]
pub struct PatchDef {
    pub name: String,
    pub icomp: usize,
    pub ocomp: Option<usize>,
    pub spec_l2g: Vec<usize>,
    pub spec_g2l: Vec<Option<usize>>,
    pub sreacs: Vec<SReacDef>,
    pub sdiffs: Vec<SDiffDef>,
    /// Local -> global tri index
    pub tris: Vec<usize>,
    pub tri_areas: Vec<f64>,
    pub area: f64,
    pub slot_base: usize,
}

impl PatchDef {
    pub fn n_specs(&self) -> usize {
        self.spec_l2g.len()
    }

    pub fn slot(&self, tri_local: usize, spec_local: usize) -> usize {
        self.slot_base + tri_local * self.n_specs() + spec_local
    }
}

/// The resolved flat index space: species, reactions and diffusion rules
/// bound to their compartments and patches, plus the slot layout of the
/// global state vector (compartment blocks first, then patch blocks;
/// elements in local order, species in local order within each element).
#[derive(Debug, Clone)]
pub struct StateDef {
    pub species: Vec<String>,
    pub comps: Vec<CompDef>,
    pub patches: Vec<PatchDef>,
    /// Global tet -> (compartment, local tet)
    pub tet_index: Vec<Option<(usize, usize)>>,
    /// Global tri -> (patch, local tri)
    pub tri_index: Vec<Option<(usize, usize)>>,
    n_slots: usize,
}

fn mult_of(refs: &[tetrakin_model::SpecRef], species: &[String]) -> Result<Vec<(usize, u32)>> {
    let mut out = Vec::with_capacity(refs.len());
    for r in refs {
        let g = species
            .iter()
            .position(|s| *s == r.species)
            .ok_or_else(|| SimError::ArgumentOutOfRange(format!("unknown species '{}'", r.species)))?;
        out.push((g, r.mult));
    }
    Ok(out)
}

fn accumulate(
    refs: &[tetrakin_model::SpecRef],
    species: &[String],
    g2l: &[Option<usize>],
    n_local: usize,
) -> Result<Vec<u32>> {
    let mut v = vec![0u32; n_local];
    for (g, m) in mult_of(refs, species)? {
        let l = g2l[g].ok_or_else(|| {
            SimError::NotDefined(format!("species '{}' not defined here", species[g]))
        })?;
        v[l] += m;
    }
    Ok(v)
}

fn update_vec(lhs: &[u32], rhs: &[u32]) -> Vec<i32> {
    lhs.iter()
        .zip(rhs)
        .map(|(&l, &r)| r as i32 - l as i32)
        .collect()
}

impl StateDef {
    /// Resolve a model against a mesh into the flat index space.
    ///
    /// Fails with UnresolvedSystem when an attached system name is
    /// unknown, InvalidGeometry for a well-mixed compartment, NotDefined
    /// when a surface reaction reads an outer volume the patch does not
    /// have, and UnsupportedOrder for reactions beyond order 4.
    pub fn new(model: &Model, mesh: &Mesh) -> Result<Self> {
        let species: Vec<String> = model.species().to_vec();
        let n_specs = species.len();
        let n_comps = mesh.compartments().len();
        let n_patches = mesh.patches().len();

        // Pass 1: species masks per region. Compartments pick up the
        // species of their own volume systems plus the volume-side species
        // of surface reactions on adjacent patches.
        let mut comp_mask = vec![vec![false; n_specs]; n_comps];
        let mut patch_mask = vec![vec![false; n_specs]; n_patches];

        let mut comp_tets: Vec<Vec<usize>> = Vec::with_capacity(n_comps);
        for comp in mesh.compartments() {
            let tets = match &comp.geometry {
                CompGeometry::Mesh { tets } => tets.clone(),
                CompGeometry::WellMixed { .. } => {
                    return Err(SimError::InvalidGeometry(format!(
                        "compartment '{}' is well-mixed; this solver requires a tetrahedral mesh",
                        comp.name
                    )))
                }
            };
            comp_tets.push(tets);
        }

        for (ci, comp) in mesh.compartments().iter().enumerate() {
            for vname in &comp.vsys {
                let sys = model.volume_system(vname).ok_or_else(|| {
                    SimError::UnresolvedSystem(format!(
                        "volume system '{}' attached to compartment '{}' is not registered",
                        vname, comp.name
                    ))
                })?;
                for r in &sys.reactions {
                    if r.order() > MAX_ORDER {
                        return Err(SimError::UnsupportedOrder {
                            reaction: r.name.clone(),
                            order: r.order(),
                        });
                    }
                    for (g, _) in mult_of(&r.lhs, &species)?
                        .into_iter()
                        .chain(mult_of(&r.rhs, &species)?)
                    {
                        comp_mask[ci][g] = true;
                    }
                }
                for d in &sys.diffusions {
                    let g = species.iter().position(|s| *s == d.species).ok_or_else(|| {
                        SimError::ArgumentOutOfRange(format!("unknown species '{}'", d.species))
                    })?;
                    comp_mask[ci][g] = true;
                }
            }
        }

        let mut patch_comps: Vec<(usize, Option<usize>)> = Vec::with_capacity(n_patches);
        for (pi, patch) in mesh.patches().iter().enumerate() {
            let (ic, _) = mesh.compartment(&patch.inner).ok_or_else(|| {
                SimError::ArgumentOutOfRange(format!(
                    "unknown inner compartment '{}' of patch '{}'",
                    patch.inner, patch.name
                ))
            })?;
            let oc = match &patch.outer {
                Some(name) => Some(
                    mesh.compartment(name)
                        .ok_or_else(|| {
                            SimError::ArgumentOutOfRange(format!(
                                "unknown outer compartment '{}' of patch '{}'",
                                name, patch.name
                            ))
                        })?
                        .0,
                ),
                None => None,
            };
            patch_comps.push((ic, oc));

            for sname in &patch.ssys {
                let sys = model.surface_system(sname).ok_or_else(|| {
                    SimError::UnresolvedSystem(format!(
                        "surface system '{}' attached to patch '{}' is not registered",
                        sname, patch.name
                    ))
                })?;
                for sr in &sys.reactions {
                    if sr.order() > MAX_ORDER {
                        return Err(SimError::UnsupportedOrder {
                            reaction: sr.name.clone(),
                            order: sr.order(),
                        });
                    }
                    if sr.reads_outer() && oc.is_none() {
                        return Err(SimError::NotDefined(format!(
                            "surface reaction '{}' reads the outer volume but patch '{}' has no outer compartment",
                            sr.name, patch.name
                        )));
                    }
                    for (g, _) in mult_of(&sr.slhs, &species)?
                        .into_iter()
                        .chain(mult_of(&sr.srhs, &species)?)
                    {
                        patch_mask[pi][g] = true;
                    }
                    for (g, _) in mult_of(&sr.ilhs, &species)?
                        .into_iter()
                        .chain(mult_of(&sr.irhs, &species)?)
                    {
                        comp_mask[ic][g] = true;
                    }
                    if let Some(oc) = oc {
                        for (g, _) in mult_of(&sr.olhs, &species)?
                            .into_iter()
                            .chain(mult_of(&sr.orhs, &species)?)
                        {
                            comp_mask[oc][g] = true;
                        }
                    }
                }
                for d in &sys.diffusions {
                    let g = species.iter().position(|s| *s == d.species).ok_or_else(|| {
                        SimError::ArgumentOutOfRange(format!("unknown species '{}'", d.species))
                    })?;
                    patch_mask[pi][g] = true;
                }
            }
        }

        // Pass 2: local index tables, locals ordered by global index
        let build_maps = |mask: &[bool]| -> (Vec<usize>, Vec<Option<usize>>) {
            let mut l2g = Vec::new();
            let mut g2l = vec![None; mask.len()];
            for (g, &on) in mask.iter().enumerate() {
                if on {
                    g2l[g] = Some(l2g.len());
                    l2g.push(g);
                }
            }
            (l2g, g2l)
        };

        // Pass 3: compile defs and lay out slots
        let mut comps = Vec::with_capacity(n_comps);
        let mut tet_index: Vec<Option<(usize, usize)>> = vec![None; mesh.tets().len()];
        let mut slot_base = 0usize;

        for (ci, comp) in mesh.compartments().iter().enumerate() {
            let (spec_l2g, spec_g2l) = build_maps(&comp_mask[ci]);
            let n_local = spec_l2g.len();

            let mut reacs = Vec::new();
            let mut diffs = Vec::new();
            for vname in &comp.vsys {
                let sys = model.volume_system(vname).expect("resolved in pass 1");
                for r in &sys.reactions {
                    let lhs = accumulate(&r.lhs, &species, &spec_g2l, n_local)?;
                    let rhs = accumulate(&r.rhs, &species, &spec_g2l, n_local)?;
                    reacs.push(ReacDef {
                        name: r.name.clone(),
                        kcst: r.kcst,
                        order: r.order(),
                        upd: update_vec(&lhs, &rhs),
                        lhs,
                    });
                }
                for d in &sys.diffusions {
                    let g = species.iter().position(|s| *s == d.species).expect("checked");
                    diffs.push(DiffDef {
                        name: d.name.clone(),
                        dcst: d.dcst,
                        lig: spec_g2l[g].expect("diffusing species is local"),
                    });
                }
            }

            let tets = comp_tets[ci].clone();
            for (tl, &tg) in tets.iter().enumerate() {
                tet_index[tg] = Some((ci, tl));
            }
            let tet_vols: Vec<f64> = tets.iter().map(|&t| mesh.tets()[t].vol).collect();
            let volume = tet_vols.iter().sum();

            let n_tets = tets.len();
            comps.push(CompDef {
                name: comp.name.clone(),
                spec_l2g,
                spec_g2l,
                reacs,
                diffs,
                tets,
                tet_vols,
                volume,
                slot_base,
            });
            slot_base += n_tets * n_local;
        }

        let mut patches = Vec::with_capacity(n_patches);
        let mut tri_index: Vec<Option<(usize, usize)>> = vec![None; mesh.tris().len()];

        for (pi, patch) in mesh.patches().iter().enumerate() {
            let (spec_l2g, spec_g2l) = build_maps(&patch_mask[pi]);
            let n_local = spec_l2g.len();
            let (ic, oc) = patch_comps[pi];

            let mut sreacs = Vec::new();
            let mut sdiffs = Vec::new();
            for sname in &patch.ssys {
                let sys = model.surface_system(sname).expect("resolved in pass 1");
                for sr in &sys.reactions {
                    let slhs = accumulate(&sr.slhs, &species, &spec_g2l, n_local)?;
                    let srhs = accumulate(&sr.srhs, &species, &spec_g2l, n_local)?;
                    let icomp_g2l = &comps[ic].spec_g2l;
                    let n_ic = comps[ic].n_specs();
                    let ilhs = accumulate(&sr.ilhs, &species, icomp_g2l, n_ic)?;
                    let irhs = accumulate(&sr.irhs, &species, icomp_g2l, n_ic)?;
                    let (olhs, orhs) = match oc {
                        Some(oc) => {
                            let n_oc = comps[oc].n_specs();
                            (
                                accumulate(&sr.olhs, &species, &comps[oc].spec_g2l, n_oc)?,
                                accumulate(&sr.orhs, &species, &comps[oc].spec_g2l, n_oc)?,
                            )
                        }
                        None => (Vec::new(), Vec::new()),
                    };
                    sreacs.push(SReacDef {
                        name: sr.name.clone(),
                        kcst: sr.kcst,
                        order: sr.order(),
                        surface_surface: sr.is_surface_surface(),
                        inner: sr.inner(),
                        supd: update_vec(&slhs, &srhs),
                        iupd: update_vec(&ilhs, &irhs),
                        oupd: update_vec(&olhs, &orhs),
                        slhs,
                        ilhs,
                        olhs,
                    });
                }
                for d in &sys.diffusions {
                    let g = species.iter().position(|s| *s == d.species).expect("checked");
                    sdiffs.push(SDiffDef {
                        name: d.name.clone(),
                        dcst: d.dcst,
                        lig: spec_g2l[g].expect("diffusing species is local"),
                    });
                }
            }

            let tris = patch.tris.clone();
            for (tl, &tg) in tris.iter().enumerate() {
                tri_index[tg] = Some((pi, tl));
            }
            let tri_areas: Vec<f64> = tris.iter().map(|&t| mesh.tris()[t].area).collect();
            let area = tri_areas.iter().sum();

            let n_tris = tris.len();
            patches.push(PatchDef {
                name: patch.name.clone(),
                icomp: ic,
                ocomp: oc,
                spec_l2g,
                spec_g2l,
                sreacs,
                sdiffs,
                tris,
                tri_areas,
                area,
                slot_base,
            });
            slot_base += n_tris * n_local;
        }

        Ok(Self {
            species,
            comps,
            patches,
            tet_index,
            tri_index,
            n_slots: slot_base,
        })
    }

    /// Total state vector length
    pub fn n_slots(&self) -> usize {
        self.n_slots
    }

    /// Global species index by name
    pub fn spec_idx(&self, name: &str) -> Result<usize> {
        self.species
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| SimError::ArgumentOutOfRange(format!("unknown species '{}'", name)))
    }

    /// Compartment index by name
    pub fn comp_idx(&self, name: &str) -> Result<usize> {
        self.comps
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| SimError::ArgumentOutOfRange(format!("unknown compartment '{}'", name)))
    }

    /// Patch index by name
    pub fn patch_idx(&self, name: &str) -> Result<usize> {
        self.patches
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| SimError::ArgumentOutOfRange(format!("unknown patch '{}'", name)))
    }

    /// Global to compartment-local species translation
    pub fn spec_g2l(&self, comp: usize, spec: usize) -> Option<usize> {
        self.comps[comp].spec_g2l[spec]
    }
}

// =============================================================================
// PROCESS GRAPH
// =============================================================================

/// Reactant descriptor: the process rate carries a factor y[slot]^pow
#[derive(Debug, Clone, Copy)]
pub struct Reactant {
    pub pow: u32,
    pub slot: u32,
}

/// One contribution to a state slot's derivative:
/// `coeff * upd * prod(y[slot]^pow)` over the descriptor range.
#[derive(Debug, Clone, Copy)]
pub struct Process {
    pub coeff: f64,
    pub upd: i32,
    pub desc_off: u32,
    pub desc_len: u32,
    pub id: u32,
}

/// The dense precomputed derivative structure: one descriptor arena, one
/// process arena, and a per-slot offset table, so the evaluator touches
/// memory linearly. A parallel `scales` table keeps each process's
/// geometry factor (`coeff = rate_constant * scale`) for rebinding rate
/// constants without a rebuild.
#[derive(Debug, Clone)]
pub struct ProcessGraph {
    descs: Vec<Reactant>,
    procs: Vec<Process>,
    /// Length n_slots + 1
    slot_off: Vec<u32>,
    scales: Vec<f64>,
    /// Process id -> positions in the process arena
    by_id: Vec<Vec<u32>>,
}

/// Maps (element, region-local rule) pairs to process ids.
///
/// Diffusion shares one id per (element, rule) across all directions, so
/// a per-element diffusion override always rescales every direction at
/// once.
#[derive(Debug, Clone, Default)]
pub struct ProcessIndex {
    pub reac: HashMap<(usize, usize), u32>,
    pub diff: HashMap<(usize, usize), u32>,
    pub sreac: HashMap<(usize, usize), u32>,
    pub sdiff: HashMap<(usize, usize), u32>,
}

struct GraphBuilder {
    per_slot: Vec<Vec<(Process, f64)>>,
    descs: Vec<Reactant>,
    next_id: u32,
}

impl GraphBuilder {
    fn new(n_slots: usize) -> Self {
        Self {
            per_slot: vec![Vec::new(); n_slots],
            descs: Vec::new(),
            next_id: 0,
        }
    }

    fn alloc_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn push(&mut self, slot: usize, proc_: Process, scale: f64) {
        self.per_slot[slot].push((proc_, scale));
    }
}

impl ProcessGraph {
    /// Walk compartments x tets x rules and patches x tris x rules in the
    /// canonical order and materialise every process.
    pub fn build(statedef: &StateDef, mesh: &Mesh) -> Result<(Self, ProcessIndex)> {
        let mut b = GraphBuilder::new(statedef.n_slots());
        let mut index = ProcessIndex::default();

        for (ci, comp) in statedef.comps.iter().enumerate() {
            // Reactions
            for (tl, &tg) in comp.tets.iter().enumerate() {
                let tet = &mesh.tets()[tg];
                let v_scale = 1.0e3 * tet.vol * AVOGADRO;
                for (ri, reac) in comp.reacs.iter().enumerate() {
                    let scale = v_scale.powi(1 - reac.order as i32);
                    let coeff = reac.kcst * scale;
                    let id = b.alloc_id();
                    index.reac.insert((tg, ri), id);

                    let desc_off = b.descs.len() as u32;
                    for (sl, &mult) in reac.lhs.iter().enumerate() {
                        if mult > 0 {
                            b.descs.push(Reactant {
                                pow: mult,
                                slot: comp.slot(tl, sl) as u32,
                            });
                        }
                    }
                    let desc_len = b.descs.len() as u32 - desc_off;

                    for (sl, &u) in reac.upd.iter().enumerate() {
                        if u != 0 {
                            b.push(
                                comp.slot(tl, sl),
                                Process {
                                    coeff,
                                    upd: u,
                                    desc_off,
                                    desc_len,
                                    id,
                                },
                                scale,
                            );
                        }
                    }
                }
            }

            // Volume diffusion: one process pair per existing
            // same-compartment face neighbour, conductance A*D/(V*d),
            // both processes reading the donor slot.
            for (tl, &tg) in comp.tets.iter().enumerate() {
                let tet = &mesh.tets()[tg];
                for (di, diff) in comp.diffs.iter().enumerate() {
                    let id = b.alloc_id();
                    index.diff.insert((tg, di), id);
                    for f in 0..4 {
                        let Some(ng) = tet.neighbours[f] else { continue };
                        let Some((nc, nl)) = statedef.tet_index[ng] else { continue };
                        if nc != ci {
                            continue;
                        }
                        let scale = tet.face_areas[f] / (tet.vol * tet.face_dists[f]);
                        let cond = diff.dcst * scale;
                        let donor = comp.slot(tl, diff.lig);
                        let acceptor = comp.slot(nl, diff.lig);

                        let desc_off = b.descs.len() as u32;
                        b.descs.push(Reactant {
                            pow: 1,
                            slot: donor as u32,
                        });
                        let proto = Process {
                            coeff: cond,
                            upd: -1,
                            desc_off,
                            desc_len: 1,
                            id,
                        };
                        b.push(donor, proto, scale);
                        b.push(acceptor, Process { upd: 1, ..proto }, scale);
                    }
                }
            }
        }

        for (pi, patch) in statedef.patches.iter().enumerate() {
            // Surface reactions
            for (tl, &tg) in patch.tris.iter().enumerate() {
                let tri = &mesh.tris()[tg];
                let (ic, itl) = statedef.tet_index[tri.inner_tet].ok_or_else(|| {
                    SimError::InvalidGeometry(format!(
                        "patch '{}' triangle {} has an inner tet outside any compartment",
                        patch.name, tg
                    ))
                })?;
                if ic != patch.icomp {
                    return Err(SimError::InvalidGeometry(format!(
                        "patch '{}' triangle {} has its inner tet in the wrong compartment",
                        patch.name, tg
                    )));
                }
                let outer = match (tri.outer_tet, patch.ocomp) {
                    (Some(ot), Some(oc)) => match statedef.tet_index[ot] {
                        Some((c, otl)) if c == oc => Some((oc, otl)),
                        _ => {
                            return Err(SimError::InvalidGeometry(format!(
                                "patch '{}' triangle {} has its outer tet in the wrong compartment",
                                patch.name, tg
                            )))
                        }
                    },
                    _ => None,
                };

                for (si, sr) in patch.sreacs.iter().enumerate() {
                    let v_scale = if sr.surface_surface {
                        tri.area * AVOGADRO
                    } else if sr.inner {
                        1.0e3 * mesh.tets()[tri.inner_tet].vol * AVOGADRO
                    } else {
                        let ot = tri.outer_tet.ok_or_else(|| {
                            SimError::NotDefined(format!(
                                "surface reaction '{}' needs an outer tet at triangle {}",
                                sr.name, tg
                            ))
                        })?;
                        1.0e3 * mesh.tets()[ot].vol * AVOGADRO
                    };
                    let scale = v_scale.powi(1 - sr.order as i32);
                    let coeff = sr.kcst * scale;
                    let id = b.alloc_id();
                    index.sreac.insert((tg, si), id);

                    // One shared descriptor list across all three sides
                    let desc_off = b.descs.len() as u32;
                    for (sl, &mult) in sr.slhs.iter().enumerate() {
                        if mult > 0 {
                            b.descs.push(Reactant {
                                pow: mult,
                                slot: patch.slot(tl, sl) as u32,
                            });
                        }
                    }
                    for (sl, &mult) in sr.ilhs.iter().enumerate() {
                        if mult > 0 {
                            b.descs.push(Reactant {
                                pow: mult,
                                slot: statedef.comps[ic].slot(itl, sl) as u32,
                            });
                        }
                    }
                    if let Some((oc, otl)) = outer {
                        for (sl, &mult) in sr.olhs.iter().enumerate() {
                            if mult > 0 {
                                b.descs.push(Reactant {
                                    pow: mult,
                                    slot: statedef.comps[oc].slot(otl, sl) as u32,
                                });
                            }
                        }
                    }
                    let desc_len = b.descs.len() as u32 - desc_off;

                    let proto = Process {
                        coeff,
                        upd: 0,
                        desc_off,
                        desc_len,
                        id,
                    };
                    for (sl, &u) in sr.supd.iter().enumerate() {
                        if u != 0 {
                            b.push(patch.slot(tl, sl), Process { upd: u, ..proto }, scale);
                        }
                    }
                    for (sl, &u) in sr.iupd.iter().enumerate() {
                        if u != 0 {
                            b.push(
                                statedef.comps[ic].slot(itl, sl),
                                Process { upd: u, ..proto },
                                scale,
                            );
                        }
                    }
                    if let Some((oc, otl)) = outer {
                        for (sl, &u) in sr.oupd.iter().enumerate() {
                            if u != 0 {
                                b.push(
                                    statedef.comps[oc].slot(otl, sl),
                                    Process { upd: u, ..proto },
                                    scale,
                                );
                            }
                        }
                    }
                }
            }

            // Surface diffusion over the three edge neighbours,
            // conductance L*D/(A*d)
            for (tl, &tg) in patch.tris.iter().enumerate() {
                let tri = &mesh.tris()[tg];
                for (di, diff) in patch.sdiffs.iter().enumerate() {
                    let id = b.alloc_id();
                    index.sdiff.insert((tg, di), id);
                    for e in 0..3 {
                        let Some(ng) = tri.neighbours[e] else { continue };
                        let Some((np, nl)) = statedef.tri_index[ng] else { continue };
                        if np != pi {
                            continue;
                        }
                        let scale = tri.edge_lengths[e] / (tri.area * tri.edge_dists[e]);
                        let cond = diff.dcst * scale;
                        let donor = patch.slot(tl, diff.lig);
                        let acceptor = patch.slot(nl, diff.lig);

                        let desc_off = b.descs.len() as u32;
                        b.descs.push(Reactant {
                            pow: 1,
                            slot: donor as u32,
                        });
                        let proto = Process {
                            coeff: cond,
                            upd: -1,
                            desc_off,
                            desc_len: 1,
                            id,
                        };
                        b.push(donor, proto, scale);
                        b.push(acceptor, Process { upd: 1, ..proto }, scale);
                    }
                }
            }
        }

        // Flatten into arenas
        let n_slots = statedef.n_slots();
        let total: usize = b.per_slot.iter().map(|v| v.len()).sum();
        let mut procs = Vec::with_capacity(total);
        let mut scales = Vec::with_capacity(total);
        let mut slot_off = Vec::with_capacity(n_slots + 1);
        for slot in &b.per_slot {
            slot_off.push(procs.len() as u32);
            for &(p, s) in slot {
                procs.push(p);
                scales.push(s);
            }
        }
        slot_off.push(procs.len() as u32);

        let mut by_id = vec![Vec::new(); b.next_id as usize];
        for (i, p) in procs.iter().enumerate() {
            by_id[p.id as usize].push(i as u32);
        }

        Ok((
            Self {
                descs: b.descs,
                procs,
                slot_off,
                scales,
                by_id,
            },
            index,
        ))
    }

    /// Rebind the rate constant behind every process carrying `id`
    pub fn rebind(&mut self, id: u32, rate: f64) {
        for &pi in &self.by_id[id as usize] {
            self.procs[pi as usize].coeff = rate * self.scales[pi as usize];
        }
    }

    pub fn n_processes(&self) -> usize {
        self.procs.len()
    }

    /// Current per-process coefficients (checkpoint substate)
    pub fn coeffs(&self) -> Vec<f64> {
        self.procs.iter().map(|p| p.coeff).collect()
    }

    /// Restore per-process coefficients from a checkpoint substate
    pub fn set_coeffs(&mut self, coeffs: &[f64]) -> Result<()> {
        if coeffs.len() != self.procs.len() {
            return Err(SimError::CheckpointMismatch(format!(
                "coefficient table length {} does not match {} processes",
                coeffs.len(),
                self.procs.len()
            )));
        }
        for (p, &c) in self.procs.iter_mut().zip(coeffs) {
            p.coeff = c;
        }
        Ok(())
    }
}

// =============================================================================
// RATE EVALUATOR
// =============================================================================

impl OdeRhs for ProcessGraph {
    fn dim(&self) -> usize {
        self.slot_off.len() - 1
    }

    fn eval(&self, _t: Time, y: &[f64], dydt: &mut [f64]) {
        for i in 0..self.slot_off.len() - 1 {
            let lo = self.slot_off[i] as usize;
            let hi = self.slot_off[i + 1] as usize;
            let mut s = 0.0;
            for p in &self.procs[lo..hi] {
                let mut r = p.coeff * p.upd as f64;
                let d_lo = p.desc_off as usize;
                let d_hi = d_lo + p.desc_len as usize;
                for d in &self.descs[d_lo..d_hi] {
                    let yv = y[d.slot as usize];
                    r *= if d.pow == 1 { yv } else { yv.powi(d.pow as i32) };
                }
                s += r;
            }
            dydt[i] = s;
        }
    }
}

// =============================================================================
// INTEGRATOR
// =============================================================================

/// Abstract ODE integrator contract.
///
/// The right-hand side is handed to `advance` (rather than captured at
/// `init`) so the integrator can borrow it for exactly one call.
/// Construction takes the place of `create`; dropping frees.
pub trait Integrator {
    fn init(&mut self, t0: Time, y0: &[f64]);
    fn set_tolerances(&mut self, rtol: f64, atol: &[f64]);
    fn set_max_steps(&mut self, n: u32);
    /// Discard step history and restart from (t, y)
    fn reinit(&mut self, t: Time, y: &[f64]);
    /// Integrate to `t_end`, writing the reached state into `y_out`.
    /// On failure the state is the last accepted step.
    fn advance(&mut self, rhs: &dyn OdeRhs, t_end: Time, y_out: &mut [f64]) -> Result<Time>;
    fn time(&self) -> Time;
}

// Dormand-Prince 5(4) tableau
const A21: f64 = 1.0 / 5.0;
const A31: f64 = 3.0 / 40.0;
const A32: f64 = 9.0 / 40.0;
const A41: f64 = 44.0 / 45.0;
const A42: f64 = -56.0 / 15.0;
const A43: f64 = 32.0 / 9.0;
const A51: f64 = 19372.0 / 6561.0;
const A52: f64 = -25360.0 / 2187.0;
const A53: f64 = 64448.0 / 6561.0;
const A54: f64 = -212.0 / 729.0;
const A61: f64 = 9017.0 / 3168.0;
const A62: f64 = -355.0 / 33.0;
const A63: f64 = 46732.0 / 5247.0;
const A64: f64 = 49.0 / 176.0;
const A65: f64 = -5103.0 / 18656.0;
const C2: f64 = 1.0 / 5.0;
const C3: f64 = 3.0 / 10.0;
const C4: f64 = 4.0 / 5.0;
const C5: f64 = 8.0 / 9.0;
const B1: f64 = 35.0 / 384.0;
const B3: f64 = 500.0 / 1113.0;
const B4: f64 = 125.0 / 192.0;
const B5: f64 = -2187.0 / 6784.0;
const B6: f64 = 11.0 / 84.0;
// Fifth-order minus embedded fourth-order weights
const E1: f64 = 71.0 / 57600.0;
const E3: f64 = -71.0 / 16695.0;
const E4: f64 = 71.0 / 1920.0;
const E5: f64 = -17253.0 / 339200.0;
const E6: f64 = 22.0 / 525.0;
const E7: f64 = -1.0 / 40.0;

const SAFETY: f64 = 0.9;
const FAC_MIN: f64 = 0.2;
const FAC_MAX: f64 = 5.0;

/// Serial dense Dormand-Prince 5(4) integrator with FSAL.
///
/// All stage buffers are allocated once at construction; nothing is
/// allocated while stepping. Step size is re-derived at the start of
/// every `advance`, so no multi-step history crosses an `advance`
/// boundary and a trajectory is a pure function of (t, y, tolerances).
pub struct Dopri5 {
    t: Time,
    y: Vec<f64>,
    rtol: f64,
    atol: Vec<f64>,
    max_steps: u32,
    k: [Vec<f64>; 7],
    y_stage: Vec<f64>,
    y_new: Vec<f64>,
}

impl Dopri5 {
    pub fn new(n_eq: usize) -> Self {
        Self {
            t: 0.0,
            y: vec![0.0; n_eq],
            rtol: DEFAULT_RTOL,
            atol: vec![DEFAULT_ATOL; n_eq],
            max_steps: DEFAULT_MAX_STEPS,
            k: std::array::from_fn(|_| vec![0.0; n_eq]),
            y_stage: vec![0.0; n_eq],
            y_new: vec![0.0; n_eq],
        }
    }

    fn error_weight(&self, i: usize, y_a: f64, y_b: f64) -> f64 {
        self.atol[i] + self.rtol * y_a.abs().max(y_b.abs()) + f64::MIN_POSITIVE
    }

    /// Crude first-step guess from the scaled norms of y and f(t, y)
    fn initial_step(&self, span: f64) -> f64 {
        let n = self.y.len().max(1) as f64;
        let mut d0 = 0.0;
        let mut d1 = 0.0;
        for i in 0..self.y.len() {
            let sc = self.error_weight(i, self.y[i], self.y[i]);
            d0 += (self.y[i] / sc).powi(2);
            d1 += (self.k[0][i] / sc).powi(2);
        }
        d0 = (d0 / n).sqrt();
        d1 = (d1 / n).sqrt();
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        };
        h0.min(span)
    }
}

impl Integrator for Dopri5 {
    fn init(&mut self, t0: Time, y0: &[f64]) {
        self.t = t0;
        self.y.copy_from_slice(y0);
    }

    fn set_tolerances(&mut self, rtol: f64, atol: &[f64]) {
        self.rtol = rtol;
        self.atol.copy_from_slice(atol);
    }

    fn set_max_steps(&mut self, n: u32) {
        self.max_steps = n;
    }

    fn reinit(&mut self, t: Time, y: &[f64]) {
        self.init(t, y);
    }

    fn advance(&mut self, rhs: &dyn OdeRhs, t_end: Time, y_out: &mut [f64]) -> Result<Time> {
        let n = self.y.len();
        if t_end <= self.t {
            y_out.copy_from_slice(&self.y);
            return Ok(self.t);
        }

        rhs.eval(self.t, &self.y, &mut self.k[0]);
        let mut h = self.initial_step(t_end - self.t);
        let mut steps = 0u32;

        while self.t < t_end {
            if steps >= self.max_steps {
                y_out.copy_from_slice(&self.y);
                return Err(SimError::IntegrationFailure(format!(
                    "step budget of {} exhausted at t = {:.6e}",
                    self.max_steps, self.t
                )));
            }
            if h < f64::EPSILON * self.t.abs().max(1.0) {
                y_out.copy_from_slice(&self.y);
                return Err(SimError::IntegrationFailure(format!(
                    "step size underflow at t = {:.6e}",
                    self.t
                )));
            }
            steps += 1;
            let mut last = false;
            if self.t + h > t_end {
                h = t_end - self.t;
                last = true;
            }

            // Stages 2..6
            for j in 0..n {
                self.y_stage[j] = self.y[j] + h * A21 * self.k[0][j];
            }
            rhs.eval(self.t + C2 * h, &self.y_stage, &mut self.k[1]);
            for j in 0..n {
                self.y_stage[j] = self.y[j] + h * (A31 * self.k[0][j] + A32 * self.k[1][j]);
            }
            rhs.eval(self.t + C3 * h, &self.y_stage, &mut self.k[2]);
            for j in 0..n {
                self.y_stage[j] = self.y[j]
                    + h * (A41 * self.k[0][j] + A42 * self.k[1][j] + A43 * self.k[2][j]);
            }
            rhs.eval(self.t + C4 * h, &self.y_stage, &mut self.k[3]);
            for j in 0..n {
                self.y_stage[j] = self.y[j]
                    + h * (A51 * self.k[0][j]
                        + A52 * self.k[1][j]
                        + A53 * self.k[2][j]
                        + A54 * self.k[3][j]);
            }
            rhs.eval(self.t + C5 * h, &self.y_stage, &mut self.k[4]);
            for j in 0..n {
                self.y_stage[j] = self.y[j]
                    + h * (A61 * self.k[0][j]
                        + A62 * self.k[1][j]
                        + A63 * self.k[2][j]
                        + A64 * self.k[3][j]
                        + A65 * self.k[4][j]);
            }
            rhs.eval(self.t + h, &self.y_stage, &mut self.k[5]);

            // Fifth-order solution; its derivative is the FSAL stage
            for j in 0..n {
                self.y_new[j] = self.y[j]
                    + h * (B1 * self.k[0][j]
                        + B3 * self.k[2][j]
                        + B4 * self.k[3][j]
                        + B5 * self.k[4][j]
                        + B6 * self.k[5][j]);
            }
            rhs.eval(self.t + h, &self.y_new, &mut self.k[6]);

            // Weighted RMS error norm
            let mut err_sq = 0.0;
            for j in 0..n {
                let e = h * (E1 * self.k[0][j]
                    + E3 * self.k[2][j]
                    + E4 * self.k[3][j]
                    + E5 * self.k[4][j]
                    + E6 * self.k[5][j]
                    + E7 * self.k[6][j]);
                let sc = self.error_weight(j, self.y[j], self.y_new[j]);
                err_sq += (e / sc).powi(2);
            }
            let err_norm = (err_sq / n.max(1) as f64).sqrt();

            let fac = if err_norm > 0.0 && err_norm.is_finite() {
                (SAFETY * err_norm.powf(-0.2)).clamp(FAC_MIN, FAC_MAX)
            } else if err_norm == 0.0 {
                FAC_MAX
            } else {
                FAC_MIN
            };

            if err_norm <= 1.0 {
                self.t = if last { t_end } else { self.t + h };
                std::mem::swap(&mut self.y, &mut self.y_new);
                // Clamp tiny negative excursions to zero; a clamp
                // invalidates the FSAL derivative, so recompute it.
                let mut clamped = false;
                for j in 0..n {
                    if self.y[j] < 0.0 {
                        let sc = self.atol[j] + self.rtol * self.y[j].abs();
                        if self.y[j] > -sc {
                            self.y[j] = 0.0;
                            clamped = true;
                        }
                    }
                }
                if clamped {
                    rhs.eval(self.t, &self.y, &mut self.k[0]);
                } else {
                    self.k.swap(0, 6);
                }
                h *= fac;
            } else {
                h *= fac.min(SAFETY);
            }
        }

        y_out.copy_from_slice(&self.y);
        Ok(self.t)
    }

    fn time(&self) -> Time {
        self.t
    }
}

// =============================================================================
// SIMULATION DRIVER
// =============================================================================

/// Checkpoint fingerprint: the structural identity of a configuration.
/// Mutable per-process coefficients are deliberately excluded so a
/// checkpoint taken after rate rebinds still matches its configuration.
#[derive(Serialize)]
struct RegionPrint {
    name: String,
    n_elems: usize,
    spec_l2g: Vec<usize>,
    rules: Vec<String>,
}

#[derive(Serialize)]
struct Fingerprint<'a> {
    species: &'a [String],
    comps: Vec<RegionPrint>,
    patches: Vec<RegionPrint>,
    n_slots: usize,
}

/// Deterministic reaction-diffusion simulation on a tetrahedral mesh.
///
/// A value of this type is always fully configured: construction performs
/// the whole setup (index resolution, process graph build, buffer
/// allocation) and setup errors are constructor errors. After setup only
/// the state vector, per-process coefficients and integrator state
/// mutate; every mutation flags the integrator for reinitialisation
/// before the next `run`.
pub struct TetOdeSimulation {
    statedef: StateDef,
    graph: ProcessGraph,
    pindex: ProcessIndex,
    integ: Dopri5,
    y: Vec<f64>,
    abstol: Vec<f64>,
    rtol: f64,
    max_steps: u32,
    t: Time,
    pending_reinit: bool,
}

impl TetOdeSimulation {
    pub fn new(model: &Model, mesh: &Mesh) -> Result<Self> {
        let statedef = StateDef::new(model, mesh)?;
        let (graph, pindex) = ProcessGraph::build(&statedef, mesh)?;
        let n = statedef.n_slots();
        Ok(Self {
            statedef,
            graph,
            pindex,
            integ: Dopri5::new(n),
            y: vec![0.0; n],
            abstol: vec![DEFAULT_ATOL; n],
            rtol: DEFAULT_RTOL,
            max_steps: DEFAULT_MAX_STEPS,
            t: 0.0,
            pending_reinit: true,
        })
    }

    // ------------------------------------------------------------------
    // Time control
    // ------------------------------------------------------------------

    /// Last committed integration time
    pub fn time(&self) -> Time {
        self.t
    }

    /// State vector length
    pub fn n_slots(&self) -> usize {
        self.statedef.n_slots()
    }

    /// Copy of the global state vector
    pub fn state(&self) -> StateVector {
        StateVector::from(self.y.clone())
    }

    pub fn statedef(&self) -> &StateDef {
        &self.statedef
    }

    /// Advance simulated time to `t_end`, reinitialising the integrator
    /// first if any mutation happened since the last run.
    pub fn run(&mut self, t_end: Time) -> Result<()> {
        if t_end < self.t {
            return Err(SimError::TimeRegression {
                now: self.t,
                requested: t_end,
            });
        }
        if t_end == self.t {
            return Ok(());
        }
        if self.pending_reinit {
            self.integ.set_tolerances(self.rtol, &self.abstol);
            self.integ.set_max_steps(self.max_steps);
            self.integ.reinit(self.t, &self.y);
            self.pending_reinit = false;
        }
        match self.integ.advance(&self.graph, t_end, &mut self.y) {
            Ok(t) => {
                self.t = t;
                Ok(())
            }
            Err(e) => {
                // y_out already holds the last accepted state
                self.t = self.integ.time();
                Err(e)
            }
        }
    }

    /// Equivalent to `run(time() + dt)`
    pub fn advance(&mut self, dt: Time) -> Result<()> {
        if dt < 0.0 {
            return Err(SimError::ArgumentOutOfRange(format!(
                "negative time increment {}",
                dt
            )));
        }
        let t_end = self.t + dt;
        self.run(t_end)
    }

    /// Scalar absolute and relative tolerances, both non-negative
    pub fn set_tolerances(&mut self, atol: f64, rtol: f64) -> Result<()> {
        if atol < 0.0 || rtol < 0.0 || !atol.is_finite() || !rtol.is_finite() {
            return Err(SimError::InvalidTolerance(format!(
                "atol = {}, rtol = {}",
                atol, rtol
            )));
        }
        self.abstol.fill(atol);
        self.rtol = rtol;
        self.pending_reinit = true;
        Ok(())
    }

    /// Integrator step budget per run
    pub fn set_max_steps(&mut self, n: u32) {
        self.max_steps = n;
        self.pending_reinit = true;
    }

    // ------------------------------------------------------------------
    // Compartment queries
    // ------------------------------------------------------------------

    fn comp_spec(&self, comp: &str, spec: &str) -> Result<(usize, usize)> {
        let ci = self.statedef.comp_idx(comp)?;
        let sg = self.statedef.spec_idx(spec)?;
        let sl = self.statedef.spec_g2l(ci, sg).ok_or_else(|| {
            SimError::NotDefined(format!(
                "species '{}' is not defined in compartment '{}'",
                spec, comp
            ))
        })?;
        Ok((ci, sl))
    }

    /// Total molecule count of a species over all tets of a compartment
    pub fn get_comp_count(&self, comp: &str, spec: &str) -> Result<f64> {
        let (ci, sl) = self.comp_spec(comp, spec)?;
        let cd = &self.statedef.comps[ci];
        Ok((0..cd.tets.len()).map(|tl| self.y[cd.slot(tl, sl)]).sum())
    }

    /// Distribute `n` molecules over the compartment by volume fraction
    pub fn set_comp_count(&mut self, comp: &str, spec: &str, n: f64) -> Result<()> {
        if n < 0.0 || !n.is_finite() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "invalid molecule count {}",
                n
            )));
        }
        let (ci, sl) = self.comp_spec(comp, spec)?;
        let cd = &self.statedef.comps[ci];
        for tl in 0..cd.tets.len() {
            self.y[cd.slot(tl, sl)] = n * cd.tet_vols[tl] / cd.volume;
        }
        self.pending_reinit = true;
        Ok(())
    }

    /// Compartment-average concentration (mol/L)
    pub fn get_comp_conc(&self, comp: &str, spec: &str) -> Result<Conc> {
        let count = self.get_comp_count(comp, spec)?;
        let ci = self.statedef.comp_idx(comp)?;
        Ok(count_to_conc(count, self.statedef.comps[ci].volume))
    }

    /// Set a uniform concentration (mol/L) across the compartment
    pub fn set_comp_conc(&mut self, comp: &str, spec: &str, conc: Conc) -> Result<()> {
        if conc < 0.0 || !conc.is_finite() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "invalid concentration {}",
                conc
            )));
        }
        let (ci, sl) = self.comp_spec(comp, spec)?;
        let cd = &self.statedef.comps[ci];
        for tl in 0..cd.tets.len() {
            self.y[cd.slot(tl, sl)] = conc_to_count(conc, cd.tet_vols[tl]);
        }
        self.pending_reinit = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Patch queries
    // ------------------------------------------------------------------

    fn patch_spec(&self, patch: &str, spec: &str) -> Result<(usize, usize)> {
        let pi = self.statedef.patch_idx(patch)?;
        let sg = self.statedef.spec_idx(spec)?;
        let sl = self.statedef.patches[pi].spec_g2l[sg].ok_or_else(|| {
            SimError::NotDefined(format!(
                "species '{}' is not defined in patch '{}'",
                spec, patch
            ))
        })?;
        Ok((pi, sl))
    }

    /// Total molecule count of a species over all triangles of a patch
    pub fn get_patch_count(&self, patch: &str, spec: &str) -> Result<f64> {
        let (pi, sl) = self.patch_spec(patch, spec)?;
        let pd = &self.statedef.patches[pi];
        Ok((0..pd.tris.len()).map(|tl| self.y[pd.slot(tl, sl)]).sum())
    }

    /// Distribute `n` molecules over the patch by area fraction
    pub fn set_patch_count(&mut self, patch: &str, spec: &str, n: f64) -> Result<()> {
        if n < 0.0 || !n.is_finite() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "invalid molecule count {}",
                n
            )));
        }
        let (pi, sl) = self.patch_spec(patch, spec)?;
        let pd = &self.statedef.patches[pi];
        for tl in 0..pd.tris.len() {
            self.y[pd.slot(tl, sl)] = n * pd.tri_areas[tl] / pd.area;
        }
        self.pending_reinit = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Per-element queries
    // ------------------------------------------------------------------

    fn tet_spec(&self, tet: usize, spec: &str) -> Result<(usize, usize, usize)> {
        let (ci, tl) = self
            .statedef
            .tet_index
            .get(tet)
            .copied()
            .flatten()
            .ok_or_else(|| {
                SimError::ArgumentOutOfRange(format!("tet {} is not in any compartment", tet))
            })?;
        let sg = self.statedef.spec_idx(spec)?;
        let sl = self.statedef.spec_g2l(ci, sg).ok_or_else(|| {
            SimError::NotDefined(format!(
                "species '{}' is not defined in the compartment of tet {}",
                spec, tet
            ))
        })?;
        Ok((ci, tl, sl))
    }

    pub fn get_tet_count(&self, tet: usize, spec: &str) -> Result<f64> {
        let (ci, tl, sl) = self.tet_spec(tet, spec)?;
        Ok(self.y[self.statedef.comps[ci].slot(tl, sl)])
    }

    pub fn set_tet_count(&mut self, tet: usize, spec: &str, n: f64) -> Result<()> {
        if n < 0.0 || !n.is_finite() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "invalid molecule count {}",
                n
            )));
        }
        let (ci, tl, sl) = self.tet_spec(tet, spec)?;
        self.y[self.statedef.comps[ci].slot(tl, sl)] = n;
        self.pending_reinit = true;
        Ok(())
    }

    /// Concentration (mol/L) in one tet
    pub fn get_tet_conc(&self, tet: usize, spec: &str) -> Result<Conc> {
        let (ci, tl, sl) = self.tet_spec(tet, spec)?;
        let cd = &self.statedef.comps[ci];
        Ok(count_to_conc(self.y[cd.slot(tl, sl)], cd.tet_vols[tl]))
    }

    pub fn set_tet_conc(&mut self, tet: usize, spec: &str, conc: Conc) -> Result<()> {
        if conc < 0.0 || !conc.is_finite() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "invalid concentration {}",
                conc
            )));
        }
        let (ci, tl, sl) = self.tet_spec(tet, spec)?;
        let cd = &self.statedef.comps[ci];
        self.y[cd.slot(tl, sl)] = conc_to_count(conc, cd.tet_vols[tl]);
        self.pending_reinit = true;
        Ok(())
    }

    fn tri_spec(&self, tri: usize, spec: &str) -> Result<(usize, usize, usize)> {
        let (pi, tl) = self
            .statedef
            .tri_index
            .get(tri)
            .copied()
            .flatten()
            .ok_or_else(|| {
                SimError::ArgumentOutOfRange(format!("tri {} is not in any patch", tri))
            })?;
        let sg = self.statedef.spec_idx(spec)?;
        let sl = self.statedef.patches[pi].spec_g2l[sg].ok_or_else(|| {
            SimError::NotDefined(format!(
                "species '{}' is not defined in the patch of tri {}",
                spec, tri
            ))
        })?;
        Ok((pi, tl, sl))
    }

    pub fn get_tri_count(&self, tri: usize, spec: &str) -> Result<f64> {
        let (pi, tl, sl) = self.tri_spec(tri, spec)?;
        Ok(self.y[self.statedef.patches[pi].slot(tl, sl)])
    }

    pub fn set_tri_count(&mut self, tri: usize, spec: &str, n: f64) -> Result<()> {
        if n < 0.0 || !n.is_finite() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "invalid molecule count {}",
                n
            )));
        }
        let (pi, tl, sl) = self.tri_spec(tri, spec)?;
        self.y[self.statedef.patches[pi].slot(tl, sl)] = n;
        self.pending_reinit = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Rate constant rebinding
    // ------------------------------------------------------------------

    fn check_rate(k: f64) -> Result<()> {
        if k < 0.0 || !k.is_finite() {
            return Err(SimError::ArgumentOutOfRange(format!(
                "invalid rate constant {}",
                k
            )));
        }
        Ok(())
    }

    /// Rebind the rate constant of one reaction in one tet
    pub fn set_tet_reac_k(&mut self, tet: usize, reac: &str, k: f64) -> Result<()> {
        Self::check_rate(k)?;
        let (ci, _) = self
            .statedef
            .tet_index
            .get(tet)
            .copied()
            .flatten()
            .ok_or_else(|| {
                SimError::ArgumentOutOfRange(format!("tet {} is not in any compartment", tet))
            })?;
        let ri = self.statedef.comps[ci]
            .reacs
            .iter()
            .position(|r| r.name == reac)
            .ok_or_else(|| {
                SimError::NotDefined(format!(
                    "reaction '{}' is not defined in the compartment of tet {}",
                    reac, tet
                ))
            })?;
        let id = self.pindex.reac[&(tet, ri)];
        self.graph.rebind(id, k);
        self.pending_reinit = true;
        Ok(())
    }

    /// Rebind one reaction's rate constant across a whole compartment
    pub fn set_comp_reac_k(&mut self, comp: &str, reac: &str, k: f64) -> Result<()> {
        Self::check_rate(k)?;
        let ci = self.statedef.comp_idx(comp)?;
        let ri = self.statedef.comps[ci]
            .reacs
            .iter()
            .position(|r| r.name == reac)
            .ok_or_else(|| {
                SimError::NotDefined(format!(
                    "reaction '{}' is not defined in compartment '{}'",
                    reac, comp
                ))
            })?;
        let tets = self.statedef.comps[ci].tets.clone();
        for tg in tets {
            let id = self.pindex.reac[&(tg, ri)];
            self.graph.rebind(id, k);
        }
        self.pending_reinit = true;
        Ok(())
    }

    /// Rebind a surface reaction's rate constant at one triangle. The
    /// shared process id also rebinds the reaction's processes on the
    /// adjacent inner/outer tet slots.
    pub fn set_tri_sreac_k(&mut self, tri: usize, sreac: &str, k: f64) -> Result<()> {
        Self::check_rate(k)?;
        let (pi, _) = self
            .statedef
            .tri_index
            .get(tri)
            .copied()
            .flatten()
            .ok_or_else(|| {
                SimError::ArgumentOutOfRange(format!("tri {} is not in any patch", tri))
            })?;
        let si = self.statedef.patches[pi]
            .sreacs
            .iter()
            .position(|r| r.name == sreac)
            .ok_or_else(|| {
                SimError::NotDefined(format!(
                    "surface reaction '{}' is not defined in the patch of tri {}",
                    sreac, tri
                ))
            })?;
        let id = self.pindex.sreac[&(tri, si)];
        self.graph.rebind(id, k);
        self.pending_reinit = true;
        Ok(())
    }

    /// Rebind a surface reaction's rate constant across a whole patch
    pub fn set_patch_sreac_k(&mut self, patch: &str, sreac: &str, k: f64) -> Result<()> {
        Self::check_rate(k)?;
        let pi = self.statedef.patch_idx(patch)?;
        let si = self.statedef.patches[pi]
            .sreacs
            .iter()
            .position(|r| r.name == sreac)
            .ok_or_else(|| {
                SimError::NotDefined(format!(
                    "surface reaction '{}' is not defined in patch '{}'",
                    sreac, patch
                ))
            })?;
        let tris = self.statedef.patches[pi].tris.clone();
        for tg in tris {
            let id = self.pindex.sreac[&(tg, si)];
            self.graph.rebind(id, k);
        }
        self.pending_reinit = true;
        Ok(())
    }

    /// Rebind a diffusion constant at one tet. One process id covers all
    /// four directions of the tet, so they rescale together.
    pub fn set_tet_diff_d(&mut self, tet: usize, diff: &str, d: f64) -> Result<()> {
        Self::check_rate(d)?;
        let (ci, _) = self
            .statedef
            .tet_index
            .get(tet)
            .copied()
            .flatten()
            .ok_or_else(|| {
                SimError::ArgumentOutOfRange(format!("tet {} is not in any compartment", tet))
            })?;
        let di = self.statedef.comps[ci]
            .diffs
            .iter()
            .position(|r| r.name == diff)
            .ok_or_else(|| {
                SimError::NotDefined(format!(
                    "diffusion rule '{}' is not defined in the compartment of tet {}",
                    diff, tet
                ))
            })?;
        let id = self.pindex.diff[&(tet, di)];
        self.graph.rebind(id, d);
        self.pending_reinit = true;
        Ok(())
    }

    /// Rebind a surface diffusion constant at one triangle
    pub fn set_tri_sdiff_d(&mut self, tri: usize, diff: &str, d: f64) -> Result<()> {
        Self::check_rate(d)?;
        let (pi, _) = self
            .statedef
            .tri_index
            .get(tri)
            .copied()
            .flatten()
            .ok_or_else(|| {
                SimError::ArgumentOutOfRange(format!("tri {} is not in any patch", tri))
            })?;
        let di = self.statedef.patches[pi]
            .sdiffs
            .iter()
            .position(|r| r.name == diff)
            .ok_or_else(|| {
                SimError::NotDefined(format!(
                    "surface diffusion rule '{}' is not defined in the patch of tri {}",
                    diff, tri
                ))
            })?;
        let id = self.pindex.sdiff[&(tri, di)];
        self.graph.rebind(id, d);
        self.pending_reinit = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Unimplemented API surface
    // ------------------------------------------------------------------

    pub fn set_comp_spec_clamped(&mut self, _comp: &str, _spec: &str, _on: bool) -> Result<()> {
        Err(SimError::NotImplemented("species clamping"))
    }

    pub fn set_tet_spec_clamped(&mut self, _tet: usize, _spec: &str, _on: bool) -> Result<()> {
        Err(SimError::NotImplemented("species clamping"))
    }

    pub fn set_tet_reac_active(&mut self, _tet: usize, _reac: &str, _on: bool) -> Result<()> {
        Err(SimError::NotImplemented("per-element reaction activation"))
    }

    pub fn set_tri_sreac_active(&mut self, _tri: usize, _sreac: &str, _on: bool) -> Result<()> {
        Err(SimError::NotImplemented("per-element reaction activation"))
    }

    // ------------------------------------------------------------------
    // Checkpointing
    // ------------------------------------------------------------------

    fn fingerprint_bytes(&self) -> Result<Vec<u8>> {
        let region = |name: &str, n_elems: usize, l2g: &[usize], rules: Vec<String>| RegionPrint {
            name: name.to_string(),
            n_elems,
            spec_l2g: l2g.to_vec(),
            rules,
        };
        let fp = Fingerprint {
            species: &self.statedef.species,
            comps: self
                .statedef
                .comps
                .iter()
                .map(|c| {
                    let rules = c
                        .reacs
                        .iter()
                        .map(|r| r.name.clone())
                        .chain(c.diffs.iter().map(|d| d.name.clone()))
                        .collect();
                    region(&c.name, c.tets.len(), &c.spec_l2g, rules)
                })
                .collect(),
            patches: self
                .statedef
                .patches
                .iter()
                .map(|p| {
                    let rules = p
                        .sreacs
                        .iter()
                        .map(|r| r.name.clone())
                        .chain(p.sdiffs.iter().map(|d| d.name.clone()))
                        .collect();
                    region(&p.name, p.tris.len(), &p.spec_l2g, rules)
                })
                .collect(),
            n_slots: self.statedef.n_slots(),
        };
        serde_json::to_vec(&fp)
            .map_err(|e| SimError::IoError(std::io::Error::new(std::io::ErrorKind::Other, e)))
    }

    /// Write the full mutable state to a little-endian binary file:
    /// state-def fingerprint, per-process coefficient table, t, rtol,
    /// max_steps, abstol vector, state vector.
    pub fn checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        let blob = self.fingerprint_bytes()?;
        w.write_all(&(blob.len() as u64).to_le_bytes())?;
        w.write_all(&blob)?;
        let coeffs = self.graph.coeffs();
        w.write_all(&(coeffs.len() as u64).to_le_bytes())?;
        for c in &coeffs {
            w.write_all(&c.to_le_bytes())?;
        }
        w.write_all(&self.t.to_le_bytes())?;
        w.write_all(&self.rtol.to_le_bytes())?;
        w.write_all(&self.max_steps.to_le_bytes())?;
        for a in &self.abstol {
            w.write_all(&a.to_le_bytes())?;
        }
        for v in &self.y {
            w.write_all(&v.to_le_bytes())?;
        }
        w.flush()?;
        Ok(())
    }

    /// Restore a checkpoint written by [`checkpoint`](Self::checkpoint).
    /// Fails with CheckpointMismatch unless the stored fingerprint
    /// identity-matches this configuration.
    pub fn restore<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let mut r = BufReader::new(File::open(path)?);

        let blob_len = read_u64(&mut r)? as usize;
        let mut blob = vec![0u8; blob_len];
        r.read_exact(&mut blob)?;
        if blob != self.fingerprint_bytes()? {
            return Err(SimError::CheckpointMismatch(
                "state definition does not match the current configuration".into(),
            ));
        }

        let n_coeffs = read_u64(&mut r)? as usize;
        let mut coeffs = vec![0.0; n_coeffs];
        for c in coeffs.iter_mut() {
            *c = read_f64(&mut r)?;
        }
        self.graph.set_coeffs(&coeffs)?;

        self.t = read_f64(&mut r)?;
        self.rtol = read_f64(&mut r)?;
        self.max_steps = read_u32(&mut r)?;
        for a in self.abstol.iter_mut() {
            *a = read_f64(&mut r)?;
        }
        for v in self.y.iter_mut() {
            *v = read_f64(&mut r)?;
        }
        self.pending_reinit = true;
        Ok(())
    }
}

fn read_u64<R: Read>(r: &mut R) -> Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn read_u32<R: Read>(r: &mut R) -> Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_f64<R: Read>(r: &mut R) -> Result<f64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(f64::from_le_bytes(b))
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tetrakin_geom::meshes;
    use tetrakin_model::{models, spec, Reaction, SpecRef, SurfaceDiffusion, SurfaceReaction};

    // Chain geometry: conductance A*D/(V*d) = 1e-12*1e-10/(1e-18*1e-6)
    // = 100 per second with these metrics and D = 1e-10
    const VOL: f64 = 1e-18;
    const AREA: f64 = 1e-12;
    const DIST: f64 = 1e-6;

    fn tmp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("tetrakin_{}_{}.bin", name, std::process::id()))
    }

    fn chain_sim(n: usize, dcst: f64) -> TetOdeSimulation {
        let model = models::diffusion_only(dcst);
        let mesh = meshes::tet_chain(n, VOL, AREA, DIST);
        TetOdeSimulation::new(&model, &mesh).unwrap()
    }

    #[test]
    fn test_state_vector_length() {
        // 4 tets x 3 species
        let model = models::ab_binding();
        let mesh = meshes::tet_chain(4, VOL, AREA, DIST);
        let sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        assert_eq!(sim.n_slots(), 12);

        // 1 tet x 1 species (Ca, pulled in by the surface reaction)
        // + 1 tri x 2 species (R, RCa)
        let model = models::surface_binding();
        let mesh = meshes::patched_tet(VOL, AREA);
        let sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        assert_eq!(sim.n_slots(), 3);
    }

    #[test]
    fn test_undefined_species_has_no_slots() {
        let mut model = models::ab_binding();
        model.add_species("Z").unwrap();
        let mesh = meshes::tet_chain(2, VOL, AREA, DIST);
        let sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        assert_eq!(sim.n_slots(), 6);
        assert!(matches!(
            sim.get_comp_count("cyto", "Z"),
            Err(SimError::NotDefined(_))
        ));
    }

    #[test]
    fn test_rate_evaluator_diffusion_pair() {
        let model = models::diffusion_only(1e-10);
        let mesh = meshes::tet_chain(2, VOL, AREA, DIST);
        let statedef = StateDef::new(&model, &mesh).unwrap();
        let (graph, _) = ProcessGraph::build(&statedef, &mesh).unwrap();

        let y = [1000.0, 0.0];
        let mut dydt = [0.0; 2];
        graph.eval(0.0, &y, &mut dydt);
        // cond = 100/s, donor loses 1e5/s, acceptor gains the same
        assert!((dydt[0] + 1.0e5).abs() < 1e-6);
        assert!((dydt[1] - 1.0e5).abs() < 1e-6);
    }

    #[test]
    fn test_rate_evaluator_zero_order() {
        let model = models::zero_order_source(1.0);
        let mesh = meshes::single_tet(VOL);
        let statedef = StateDef::new(&model, &mesh).unwrap();
        let (graph, _) = ProcessGraph::build(&statedef, &mesh).unwrap();

        let y = [0.0];
        let mut dydt = [0.0];
        graph.eval(0.0, &y, &mut dydt);
        // c = k * 1000 * V * N_A molecules per second
        let expected = 1.0e3 * VOL * AVOGADRO;
        assert!((dydt[0] - expected).abs() / expected < 1e-12);
    }

    #[test]
    fn test_rate_evaluator_second_order() {
        let model = models::ab_binding();
        let mesh = meshes::single_tet(VOL);
        let statedef = StateDef::new(&model, &mesh).unwrap();
        let (graph, _) = ProcessGraph::build(&statedef, &mesh).unwrap();

        // species are locally ordered A, B, C
        let y = [100.0, 50.0, 10.0];
        let mut dydt = [0.0; 3];
        graph.eval(0.0, &y, &mut dydt);
        let v_scale = 1.0e3 * VOL * AVOGADRO;
        let fwd = 3.0e5 / v_scale * 100.0 * 50.0;
        let bwd = 0.7 * 10.0;
        assert!((dydt[0] - (bwd - fwd)).abs() / fwd.abs() < 1e-12);
        assert!((dydt[1] - (bwd - fwd)).abs() / fwd.abs() < 1e-12);
        assert!((dydt[2] - (fwd - bwd)).abs() / fwd.abs() < 1e-12);
    }

    #[test]
    fn test_inert_baseline() {
        // Zero diffusion constant: processes exist but carry no flux
        let mut sim = chain_sim(3, 0.0);
        sim.set_tet_count(0, "X", 123.0).unwrap();
        sim.set_tet_count(2, "X", 7.0).unwrap();
        sim.run(5.0).unwrap();
        assert_eq!(sim.get_tet_count(0, "X").unwrap(), 123.0);
        assert_eq!(sim.get_tet_count(1, "X").unwrap(), 0.0);
        assert_eq!(sim.get_tet_count(2, "X").unwrap(), 7.0);
    }

    #[test]
    fn test_diffusion_equalization() {
        let mut sim = chain_sim(10, 1e-10);
        sim.set_tolerances(1e-6, 1e-6).unwrap();
        sim.set_max_steps(1_000_000);
        sim.set_tet_count(0, "X", 1000.0).unwrap();
        sim.run(1.0).unwrap();

        let total = sim.get_comp_count("cyto", "X").unwrap();
        assert!((total - 1000.0).abs() < 1e-3, "mass drift: {}", total);
        for t in 0..10 {
            let c = sim.get_tet_count(t, "X").unwrap();
            assert!((c - 100.0).abs() < 5.0, "tet {} holds {}", t, c);
        }
    }

    #[test]
    fn test_diffusion_symmetry() {
        // Mirrored initial conditions give the mirrored trajectory
        let mut a = chain_sim(6, 1e-10);
        let mut b = chain_sim(6, 1e-10);
        a.set_tet_count(0, "X", 1000.0).unwrap();
        a.set_tet_count(5, "X", 400.0).unwrap();
        b.set_tet_count(5, "X", 1000.0).unwrap();
        b.set_tet_count(0, "X", 400.0).unwrap();
        a.set_tolerances(1e-8, 1e-8).unwrap();
        b.set_tolerances(1e-8, 1e-8).unwrap();
        a.set_max_steps(1_000_000);
        b.set_max_steps(1_000_000);
        a.run(0.05).unwrap();
        b.run(0.05).unwrap();
        for t in 0..6 {
            let ya = a.get_tet_count(t, "X").unwrap();
            let yb = b.get_tet_count(5 - t, "X").unwrap();
            assert!((ya - yb).abs() < 1e-2, "tet {}: {} vs {}", t, ya, yb);
        }
    }

    #[test]
    fn test_blocked_cross_compartment_diffusion() {
        // Diffusion never crosses a compartment boundary
        let model = models::diffusion_only(1e-10);
        let mesh = meshes::two_comp_chain(3, 3, VOL, AREA, DIST);
        let mut sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        sim.set_tet_count(0, "X", 1000.0).unwrap();
        sim.run(0.5).unwrap();

        assert_eq!(sim.get_comp_count("B", "X").unwrap(), 0.0);
        let a = sim.get_comp_count("A", "X").unwrap();
        assert!((a - 1000.0).abs() / 1000.0 < 1e-6);
    }

    #[test]
    fn test_equilibrium_ab_binding() {
        // A + B <-> C in one tet: [C]/([A][B]) relaxes to kf/kb
        let model = models::ab_binding();
        let mesh = meshes::single_tet(1.6667e-21);
        let mut sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        sim.set_tolerances(1e-8, 1e-8).unwrap();
        sim.set_max_steps(1_000_000);
        sim.set_comp_conc("cyto", "A", 31.4e-6).unwrap();
        sim.set_comp_conc("cyto", "B", 22.3e-6).unwrap();

        let a0 = sim.get_comp_count("cyto", "A").unwrap();
        let b0 = sim.get_comp_count("cyto", "B").unwrap();
        sim.run(20.0).unwrap();

        // Conservation: A + C and B + C are invariants
        let a = sim.get_comp_count("cyto", "A").unwrap();
        let b = sim.get_comp_count("cyto", "B").unwrap();
        let c = sim.get_comp_count("cyto", "C").unwrap();
        assert!((a + c - a0).abs() / a0 < 1e-6);
        assert!((b + c - b0).abs() / b0 < 1e-6);

        let ca = sim.get_comp_conc("cyto", "A").unwrap();
        let cb = sim.get_comp_conc("cyto", "B").unwrap();
        let cc = sim.get_comp_conc("cyto", "C").unwrap();
        let k_eq = cc / (ca * cb);
        let expected = 3.0e5 / 0.7;
        assert!(
            (k_eq - expected).abs() / expected < 1e-3,
            "K = {}, expected {}",
            k_eq,
            expected
        );
    }

    #[test]
    fn test_zero_order_source() {
        // d n/dt = k * 1000 * V * N_A, exactly linear in time
        let model = models::zero_order_source(1.0);
        let mesh = meshes::single_tet(VOL);
        let mut sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        sim.set_tolerances(1e-6, 1e-6).unwrap();
        sim.run(1.0).unwrap();

        let expected = 1.0e3 * VOL * AVOGADRO;
        let n = sim.get_comp_count("cyto", "A").unwrap();
        assert!((n - expected).abs() / expected < 1e-9, "n = {}", n);
    }

    #[test]
    fn test_surface_binding() {
        // R + Ca(inner volume) -> RCa on the membrane, Ca held by
        // repeated resets; nearly all R converts within a second
        let model = models::surface_binding();
        let mesh = meshes::patched_tet(VOL, AREA);
        let mut sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        sim.set_max_steps(1_000_000);
        sim.set_comp_conc("cyto", "Ca", 150e-6).unwrap();
        sim.set_patch_count("memb", "R", 160.0).unwrap();

        for i in 1..=10 {
            sim.run(0.1 * i as f64).unwrap();
            sim.set_comp_conc("cyto", "Ca", 150e-6).unwrap();
        }

        let rca = sim.get_patch_count("memb", "RCa").unwrap();
        let r = sim.get_patch_count("memb", "R").unwrap();
        assert!(rca >= 140.0 && rca <= 160.5, "RCa = {}", rca);
        assert!((r + rca - 160.0).abs() < 1e-6);
    }

    #[test]
    fn test_surface_reaction_across_patch() {
        // First-order pump X(inner volume) -> X(outer volume)
        let mut model = Model::new();
        model.add_species("X").unwrap();
        model.add_volume_system("vsys").unwrap();
        model.add_surface_system("ssys").unwrap();
        model
            .add_surface_reaction(
                "ssys",
                SurfaceReaction::new("pump", 5.0)
                    .with_ilhs(vec![spec("X")])
                    .with_orhs(vec![spec("X")]),
            )
            .unwrap();
        let mesh = meshes::two_comp_patched(2, 2, VOL, AREA, DIST);
        let mut sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        sim.set_tolerances(1e-8, 1e-8).unwrap();
        sim.set_max_steps(1_000_000);
        // Tet 1 is the inner tet of the interface triangle
        sim.set_tet_count(1, "X", 1000.0).unwrap();
        sim.run(1.0).unwrap();

        let a = sim.get_comp_count("A", "X").unwrap();
        let b = sim.get_comp_count("B", "X").unwrap();
        let expected_a = 1000.0 * (-5.0f64).exp();
        assert!((a - expected_a).abs() < 0.5, "A = {}", a);
        assert!((a + b - 1000.0).abs() / 1000.0 < 1e-6);
        // The pumped molecules appear in the outer tet only
        assert_eq!(sim.get_tet_count(3, "X").unwrap(), 0.0);
    }

    #[test]
    fn test_surface_diffusion_equalization() {
        let mut model = Model::new();
        model.add_species("S").unwrap();
        model.add_volume_system("vsys").unwrap();
        model.add_surface_system("ssys").unwrap();
        model
            .add_surface_diffusion("ssys", SurfaceDiffusion::new("sdiff", "S", 1e-12))
            .unwrap();
        let mesh = meshes::tri_strip(5, VOL, AREA);
        let mut sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        sim.set_tolerances(1e-6, 1e-6).unwrap();
        sim.set_max_steps(1_000_000);
        sim.set_tri_count(0, "S", 300.0).unwrap();
        sim.run(20.0).unwrap();

        let total = sim.get_patch_count("memb", "S").unwrap();
        assert!((total - 300.0).abs() < 1e-3);
        for t in 0..5 {
            let c = sim.get_tri_count(t, "S").unwrap();
            assert!((c - 60.0).abs() < 3.0, "tri {} holds {}", t, c);
        }
    }

    #[test]
    fn test_reinit_matches_fresh_start() {
        // Injecting mid-run equals restarting from the perturbed state
        let mut sim = chain_sim(4, 1e-10);
        sim.set_tolerances(1e-8, 1e-8).unwrap();
        sim.set_max_steps(1_000_000);
        sim.set_tet_count(0, "X", 1000.0).unwrap();
        sim.run(1.0).unwrap();

        let snapshot: Vec<f64> = (0..4).map(|t| sim.get_tet_count(t, "X").unwrap()).collect();
        let injected = sim.get_tet_count(2, "X").unwrap() + 10.0;
        sim.set_tet_count(2, "X", injected).unwrap();
        sim.run(2.0).unwrap();

        let mut fresh = chain_sim(4, 1e-10);
        fresh.set_tolerances(1e-8, 1e-8).unwrap();
        fresh.set_max_steps(1_000_000);
        for (t, &c) in snapshot.iter().enumerate() {
            fresh.set_tet_count(t, "X", c).unwrap();
        }
        fresh.set_tet_count(2, "X", injected).unwrap();
        fresh.run(1.0).unwrap();

        for t in 0..4 {
            let a = sim.get_tet_count(t, "X").unwrap();
            let b = fresh.get_tet_count(t, "X").unwrap();
            assert!((a - b).abs() < 1e-6 * a.abs().max(1.0), "tet {}: {} vs {}", t, a, b);
        }
    }

    #[test]
    fn test_rebind_idempotence() {
        // Setting a rate constant to its current value changes nothing
        let model = models::ab_binding();
        let mesh = meshes::single_tet(VOL);

        let mut base = TetOdeSimulation::new(&model, &mesh).unwrap();
        base.set_comp_conc("cyto", "A", 1e-6).unwrap();
        base.set_comp_conc("cyto", "B", 1e-6).unwrap();
        base.run(0.5).unwrap();

        let mut same = TetOdeSimulation::new(&model, &mesh).unwrap();
        same.set_comp_conc("cyto", "A", 1e-6).unwrap();
        same.set_comp_conc("cyto", "B", 1e-6).unwrap();
        same.set_tet_reac_k(0, "fwd", 3.0e5).unwrap();
        same.run(0.5).unwrap();

        let mut reverted = TetOdeSimulation::new(&model, &mesh).unwrap();
        reverted.set_comp_conc("cyto", "A", 1e-6).unwrap();
        reverted.set_comp_conc("cyto", "B", 1e-6).unwrap();
        reverted.set_tet_reac_k(0, "fwd", 9.9e9).unwrap();
        reverted.set_tet_reac_k(0, "fwd", 3.0e5).unwrap();
        reverted.run(0.5).unwrap();

        for s in ["A", "B", "C"] {
            let b = base.get_comp_count("cyto", s).unwrap();
            assert_eq!(b, same.get_comp_count("cyto", s).unwrap());
            assert_eq!(b, reverted.get_comp_count("cyto", s).unwrap());
        }
    }

    #[test]
    fn test_rebind_changes_rate() {
        let mut sim = chain_sim(2, 1e-10);
        sim.set_tet_count(0, "X", 1000.0).unwrap();
        // Doubling D at tet 0 doubles the conductance of both directional
        // processes sharing the tet's diffusion id
        sim.set_tet_diff_d(0, "diff_X", 2e-10).unwrap();

        let y = sim.state();
        let mut dydt = vec![0.0; 2];
        sim.graph.eval(0.0, y.as_slice().unwrap(), &mut dydt);
        assert!((dydt[0] + 2.0e5).abs() < 1e-6, "dydt[0] = {}", dydt[0]);
        assert!((dydt[1] - 2.0e5).abs() < 1e-6, "dydt[1] = {}", dydt[1]);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let path = tmp_path("roundtrip");
        let model = models::ab_binding();
        let mesh = meshes::tet_chain(3, VOL, AREA, DIST);

        let mut sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        sim.set_comp_conc("cyto", "A", 1e-6).unwrap();
        sim.set_comp_conc("cyto", "B", 1e-6).unwrap();
        sim.run(0.5).unwrap();
        sim.checkpoint(&path).unwrap();
        sim.run(1.0).unwrap();
        let direct: Vec<f64> = sim.state().to_vec();

        let mut restored = TetOdeSimulation::new(&model, &mesh).unwrap();
        restored.restore(&path).unwrap();
        assert_eq!(restored.time(), 0.5);
        restored.run(1.0).unwrap();
        let via_restore: Vec<f64> = restored.state().to_vec();

        assert_eq!(direct, via_restore);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_checkpoint_preserves_rebinds() {
        let path = tmp_path("rebinds");
        let mut sim = chain_sim(2, 1e-10);
        sim.set_tet_count(0, "X", 1000.0).unwrap();
        sim.set_tet_diff_d(0, "diff_X", 3e-10).unwrap();
        sim.checkpoint(&path).unwrap();

        let mut restored = chain_sim(2, 1e-10);
        restored.restore(&path).unwrap();
        let mut dydt = vec![0.0; 2];
        let y = restored.state();
        restored.graph.eval(0.0, y.as_slice().unwrap(), &mut dydt);
        assert!((dydt[0] + 3.0e5).abs() < 1e-6);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_checkpoint_mismatch() {
        let path = tmp_path("mismatch");
        let sim = chain_sim(3, 1e-10);
        sim.checkpoint(&path).unwrap();

        let model = models::ab_binding();
        let mesh = meshes::tet_chain(3, VOL, AREA, DIST);
        let mut other = TetOdeSimulation::new(&model, &mesh).unwrap();
        assert!(matches!(
            other.restore(&path),
            Err(SimError::CheckpointMismatch(_))
        ));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_time_regression() {
        let mut sim = chain_sim(2, 1e-10);
        sim.set_tet_count(0, "X", 10.0).unwrap();
        sim.run(1.0).unwrap();
        assert!(matches!(
            sim.run(0.5),
            Err(SimError::TimeRegression { .. })
        ));
        assert!(matches!(
            sim.advance(-0.1),
            Err(SimError::ArgumentOutOfRange(_))
        ));
        // Running to the current time is a no-op
        sim.run(1.0).unwrap();
    }

    #[test]
    fn test_invalid_tolerance() {
        let mut sim = chain_sim(2, 1e-10);
        assert!(matches!(
            sim.set_tolerances(-1e-3, 1e-3),
            Err(SimError::InvalidTolerance(_))
        ));
        assert!(matches!(
            sim.set_tolerances(1e-3, f64::NAN),
            Err(SimError::InvalidTolerance(_))
        ));
    }

    #[test]
    fn test_step_budget_exhaustion() {
        let mut sim = chain_sim(10, 1e-10);
        sim.set_tet_count(0, "X", 1000.0).unwrap();
        sim.set_max_steps(3);
        let err = sim.run(10.0);
        assert!(matches!(err, Err(SimError::IntegrationFailure(_))));
        // State is the last committed intermediate time
        assert!(sim.time() < 10.0);
        let total = sim.get_comp_count("cyto", "X").unwrap();
        assert!((total - 1000.0).abs() < 1e-3);
    }

    #[test]
    fn test_not_implemented_surface() {
        let mut sim = chain_sim(2, 1e-10);
        assert!(matches!(
            sim.set_comp_spec_clamped("cyto", "X", true),
            Err(SimError::NotImplemented(_))
        ));
        assert!(matches!(
            sim.set_tet_reac_active(0, "r", true),
            Err(SimError::NotImplemented(_))
        ));
    }

    #[test]
    fn test_unresolved_system() {
        let mut model = Model::new();
        model.add_species("X").unwrap();
        model.add_volume_system("other").unwrap();
        // Mesh compartments attach "vsys", which the model never registers
        let mesh = meshes::tet_chain(2, VOL, AREA, DIST);
        assert!(matches!(
            TetOdeSimulation::new(&model, &mesh),
            Err(SimError::UnresolvedSystem(_))
        ));
    }

    #[test]
    fn test_well_mixed_rejected() {
        let model = models::diffusion_only(1e-10);
        let mut mesh = Mesh::new();
        mesh.add_compartment(
            "wm",
            &["vsys"],
            tetrakin_geom::CompGeometry::WellMixed { volume: VOL },
        )
        .unwrap();
        assert!(matches!(
            TetOdeSimulation::new(&model, &mesh),
            Err(SimError::InvalidGeometry(_))
        ));
    }

    #[test]
    fn test_outer_volume_without_outer_comp() {
        let mut model = Model::new();
        model.add_species("X").unwrap();
        model.add_volume_system("vsys").unwrap();
        model.add_surface_system("ssys").unwrap();
        model
            .add_surface_reaction(
                "ssys",
                SurfaceReaction::new("leak", 1.0)
                    .with_ilhs(vec![spec("X")])
                    .with_orhs(vec![spec("X")]),
            )
            .unwrap();
        // patched_tet has no outer compartment
        let mesh = meshes::patched_tet(VOL, AREA);
        assert!(matches!(
            TetOdeSimulation::new(&model, &mesh),
            Err(SimError::NotDefined(_))
        ));
    }

    #[test]
    fn test_argument_errors() {
        let sim = chain_sim(2, 1e-10);
        assert!(matches!(
            sim.get_comp_count("nope", "X"),
            Err(SimError::ArgumentOutOfRange(_))
        ));
        assert!(matches!(
            sim.get_comp_count("cyto", "nope"),
            Err(SimError::ArgumentOutOfRange(_))
        ));
        assert!(matches!(
            sim.get_tet_count(99, "X"),
            Err(SimError::ArgumentOutOfRange(_))
        ));
    }

    #[test]
    fn test_set_comp_count_distributes_by_volume() {
        let mut model = Model::new();
        model.add_species("X").unwrap();
        model.add_volume_system("vsys").unwrap();
        model
            .add_reaction("vsys", Reaction::new("decay", vec![spec("X")], vec![], 0.0))
            .unwrap();
        // Two tets with volumes 1:3
        let mut mesh = Mesh::new();
        let a = mesh.add_tet(VOL, [AREA; 4], [DIST; 4]).unwrap();
        let b = mesh.add_tet(3.0 * VOL, [AREA; 4], [DIST; 4]).unwrap();
        mesh.add_compartment(
            "cyto",
            &["vsys"],
            tetrakin_geom::CompGeometry::Mesh { tets: vec![a, b] },
        )
        .unwrap();
        let mut sim = TetOdeSimulation::new(&model, &mesh).unwrap();
        sim.set_comp_count("cyto", "X", 400.0).unwrap();
        assert!((sim.get_tet_count(a, "X").unwrap() - 100.0).abs() < 1e-9);
        assert!((sim.get_tet_count(b, "X").unwrap() - 300.0).abs() < 1e-9);
        // Uniform concentration reads back equal per tet
        let ca = sim.get_tet_conc(a, "X").unwrap();
        let cb = sim.get_tet_conc(b, "X").unwrap();
        assert!((ca - cb).abs() < 1e-9 * ca.abs());
    }

    #[test]
    fn test_higher_order_descriptor() {
        // 2A -> B uses y^2 in the rate and -2/+1 updates
        let mut model = Model::new();
        model.add_species("A").unwrap();
        model.add_species("B").unwrap();
        model.add_volume_system("vsys").unwrap();
        model
            .add_reaction(
                "vsys",
                Reaction::new("dimer", vec![SpecRef::new("A", 2)], vec![spec("B")], 1.0e5),
            )
            .unwrap();
        let mesh = meshes::single_tet(VOL);
        let statedef = StateDef::new(&model, &mesh).unwrap();
        let (graph, _) = ProcessGraph::build(&statedef, &mesh).unwrap();

        let y = [10.0, 0.0];
        let mut dydt = [0.0; 2];
        graph.eval(0.0, &y, &mut dydt);
        let v_scale = 1.0e3 * VOL * AVOGADRO;
        let rate = 1.0e5 / v_scale * 100.0;
        assert!((dydt[0] + 2.0 * rate).abs() / rate < 1e-12);
        assert!((dydt[1] - rate).abs() / rate < 1e-12);
    }
}
