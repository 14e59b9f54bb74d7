//! Ground truth oracle for decay simulation.
//!
//! The oracle owns the true kinematics of every generated event:
//! - Two-body decays, isotropic in the mother's rest frame
//! - Exponential flight distances from the nominal lifetimes
//! - Detector measurements smeared around the truth

use std::f64::consts::TAU;

use nalgebra::{Matrix3, Matrix4, Matrix6, Vector3, Vector4};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Exp1, Normal};
use serde::{Deserialize, Serialize};
use treefit_core::{
    Candidate, CandidateId, OriginConfig, ParticleProperties, PdgTable, SPEED_OF_LIGHT,
};

use crate::error::SimError;

/// Decay descriptor: a species and its decay products (empty for
/// final-state particles).
#[derive(Debug, Clone, PartialEq)]
pub struct DecaySpec {
    pub pdg_code: i32,
    pub daughters: Vec<DecaySpec>,
}

impl DecaySpec {
    pub fn stable(pdg_code: i32) -> Self {
        Self {
            pdg_code,
            daughters: Vec::new(),
        }
    }

    pub fn decay(pdg_code: i32, first: DecaySpec, second: DecaySpec) -> Self {
        Self {
            pdg_code,
            daughters: vec![first, second],
        }
    }
}

/// Measurement resolutions of the simulated detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectorResolution {
    /// Track reference-point smearing per coordinate (default: 0.005 cm)
    pub track_position: f64,

    /// Track momentum smearing per component (default: 0.003 GeV)
    pub track_momentum: f64,

    /// Cluster position smearing per coordinate (default: 0.5 cm)
    pub cluster_position: f64,

    /// Relative cluster energy resolution (default: 3%)
    pub cluster_energy: f64,

    /// Distance from the production vertex to the calorimeter face (default: 150 cm)
    pub calorimeter_radius: f64,
}

impl Default for DetectorResolution {
    fn default() -> Self {
        Self {
            track_position: 0.005,
            track_momentum: 0.003,
            cluster_position: 0.5,
            cluster_energy: 0.03,
            calorimeter_radius: 150.0,
        }
    }
}

/// True parameters of one generated particle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruthParticle {
    pub id: CandidateId,
    pub pdg_code: i32,
    pub production_vertex: Vector3<f64>,
    /// Decay vertex of unstable particles
    pub decay_vertex: Option<Vector3<f64>>,
    pub momentum: Vector4<f64>,
}

impl TruthParticle {
    /// Distance between production and decay vertex.
    pub fn flight_length(&self) -> Option<f64> {
        self.decay_vertex.map(|v| (v - self.production_vertex).norm())
    }
}

/// One generated event: the measured candidate tree and its truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedEvent {
    pub head: Candidate,
    pub truth: Vec<TruthParticle>,
}

impl GeneratedEvent {
    pub fn truth_of(&self, id: CandidateId) -> Option<&TruthParticle> {
        self.truth.iter().find(|t| t.id == id)
    }
}

/// The Oracle - generates true decays and their measurements.
pub struct DecayOracle {
    rng: ChaCha8Rng,
    table: PdgTable,
    resolution: DetectorResolution,
    next_id: u32,
}

impl DecayOracle {
    /// Creates an oracle with the default particle table and detector.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            table: PdgTable::default(),
            resolution: DetectorResolution::default(),
            next_id: 0,
        }
    }

    pub fn with_resolution(mut self, resolution: DetectorResolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn resolution(&self) -> &DetectorResolution {
        &self.resolution
    }

    /// Generates one event of `spec` with the head flying along `momentum`
    /// (smeared by 10% per component), produced inside `beam_spot`.
    pub fn generate(
        &mut self,
        spec: &DecaySpec,
        momentum: Vector3<f64>,
        beam_spot: Option<&OriginConfig>,
    ) -> Result<GeneratedEvent, SimError> {
        self.next_id = 1;
        let head_info = self.info(spec.pdg_code)?;

        let mut p = momentum;
        for i in 0..3 {
            let sigma = 0.1 * momentum.norm();
            p[i] += self.gauss(sigma);
        }
        let energy = (p.norm_squared() + head_info.mass * head_info.mass).sqrt();
        let p4 = Vector4::new(p.x, p.y, p.z, energy);

        let production = match beam_spot {
            Some(origin) => {
                let mut v = Vector3::from(origin.position);
                for i in 0..3 {
                    v[i] += self.gauss(origin.covariance[i][i].sqrt());
                }
                v
            }
            None => Vector3::zeros(),
        };

        let mut truth = Vec::new();
        let head = self.produce(spec, p4, production, &mut truth)?;
        Ok(GeneratedEvent { head, truth })
    }

    fn info(&self, pdg_code: i32) -> Result<treefit_core::ParticleInfo, SimError> {
        self.table
            .lookup(pdg_code)
            .ok_or(SimError::UnknownParticle(pdg_code))
    }

    fn gauss(&mut self, sigma: f64) -> f64 {
        if sigma <= 0.0 {
            return 0.0;
        }
        match Normal::new(0.0, sigma) {
            Ok(normal) => normal.sample(&mut self.rng),
            Err(_) => 0.0,
        }
    }

    fn produce(
        &mut self,
        spec: &DecaySpec,
        p4: Vector4<f64>,
        production: Vector3<f64>,
        truth: &mut Vec<TruthParticle>,
    ) -> Result<Candidate, SimError> {
        let id = self.next_id;
        self.next_id += 1;
        let info = self.info(spec.pdg_code)?;
        let slot = truth.len();
        truth.push(TruthParticle {
            id: CandidateId(id),
            pdg_code: spec.pdg_code,
            production_vertex: production,
            decay_vertex: None,
            momentum: p4,
        });

        if spec.daughters.is_empty() {
            return Ok(self.measure(id, spec.pdg_code, info.charge, info.mass, p4, production));
        }
        let [first, second] = spec.daughters.as_slice() else {
            return Err(SimError::UnsupportedDecay(spec.pdg_code));
        };

        // Flight: βγ cτ times an exponential deviate
        let momentum = p4.xyz();
        let exp: f64 = Exp1.sample(&mut self.rng);
        let flight = if info.mass > 0.0 {
            momentum.norm() / info.mass * SPEED_OF_LIGHT * info.lifetime * exp
        } else {
            0.0
        };
        let decay_vertex = if momentum.norm() > 0.0 {
            production + momentum.normalize() * flight
        } else {
            production
        };
        truth[slot].decay_vertex = Some(decay_vertex);

        let m1 = self.info(first.pdg_code)?.mass;
        let m2 = self.info(second.pdg_code)?.mass;
        let (p1, p2) = self.two_body(info.mass, m1, m2, &p4)?;

        let daughters = vec![
            self.produce(first, p1, decay_vertex, truth)?,
            self.produce(second, p2, decay_vertex, truth)?,
        ];
        let mut candidate = Candidate::composite(id, spec.pdg_code, daughters);
        candidate.charge = info.charge as f64;
        Ok(candidate)
    }

    /// Isotropic two-body decay of `parent`, boosted to the lab.
    fn two_body(
        &mut self,
        mass: f64,
        m1: f64,
        m2: f64,
        parent: &Vector4<f64>,
    ) -> Result<(Vector4<f64>, Vector4<f64>), SimError> {
        let p_star =
            two_body_momentum(mass, m1, m2).ok_or(SimError::Kinematics { mass, m1, m2 })?;
        let cos_theta: f64 = self.rng.gen_range(-1.0..1.0);
        let phi: f64 = self.rng.gen_range(0.0..TAU);
        let sin_theta = (1.0 - cos_theta * cos_theta).sqrt();
        let direction = Vector3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta);

        let q1 = direction * p_star;
        let rest1 = Vector4::new(q1.x, q1.y, q1.z, (p_star * p_star + m1 * m1).sqrt());
        let rest2 = Vector4::new(-q1.x, -q1.y, -q1.z, (p_star * p_star + m2 * m2).sqrt());
        Ok((boost(&rest1, parent), boost(&rest2, parent)))
    }

    /// Smears the true kinematics into a detector measurement.
    fn measure(
        &mut self,
        id: u32,
        pdg_code: i32,
        charge: i32,
        mass: f64,
        p4: Vector4<f64>,
        production: Vector3<f64>,
    ) -> Candidate {
        let res = self.resolution.clone();
        let momentum = p4.xyz();

        if charge != 0 {
            let mut position = production;
            let mut measured = momentum;
            for i in 0..3 {
                position[i] += self.gauss(res.track_position);
                measured[i] += self.gauss(res.track_momentum);
            }
            let mut cov = Matrix6::zeros();
            for i in 0..3 {
                cov[(i, i)] = res.track_position.powi(2);
                cov[(i + 3, i + 3)] = res.track_momentum.powi(2);
            }
            return Candidate::track(id, pdg_code, charge as f64, mass, position, measured, cov);
        }

        let mut position = production + momentum.normalize() * res.calorimeter_radius;
        for i in 0..3 {
            position[i] += self.gauss(res.cluster_position);
        }
        let position_variance = res.cluster_position.powi(2);

        if pdg_code.abs() == 22 {
            let sigma_e = res.cluster_energy * p4[3];
            let energy = (p4[3] + self.gauss(sigma_e)).max(1e-3);
            let mut cov = Matrix4::from_diagonal_element(position_variance);
            cov[(3, 3)] = sigma_e * sigma_e;
            return Candidate::photon(id, position, energy, momentum.normalize() * energy, cov);
        }

        let cov = Matrix3::from_diagonal_element(position_variance);
        Candidate::neutral_cluster(id, pdg_code, position, p4, cov)
    }
}

/// Daughter momentum in the rest frame of a decaying `mass`; None below threshold.
pub fn two_body_momentum(mass: f64, m1: f64, m2: f64) -> Option<f64> {
    let a = mass * mass - (m1 + m2).powi(2);
    let b = mass * mass - (m1 - m2).powi(2);
    if a < 0.0 || mass <= 0.0 {
        return None;
    }
    Some((a * b).sqrt() / (2.0 * mass))
}

/// Lorentz boost of `rest` into the frame where `parent` has its momentum.
pub fn boost(rest: &Vector4<f64>, parent: &Vector4<f64>) -> Vector4<f64> {
    let beta = parent.xyz() / parent[3];
    let beta2 = beta.norm_squared();
    if beta2 == 0.0 {
        return *rest;
    }
    let gamma = 1.0 / (1.0 - beta2).sqrt();
    let q = rest.xyz();
    let bq = beta.dot(&q);
    let p = q + beta * ((gamma - 1.0) * bq / beta2 + gamma * rest[3]);
    let e = gamma * (rest[3] + bq);
    Vector4::new(p.x, p.y, p.z, e)
}
