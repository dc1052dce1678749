//! Port for the quantum-chemistry application's input/output formats. The
//! tracker treats decks and log files as opaque bytes; a codec turns them
//! into structured geometry and gradient data and back.

use std::collections::BTreeMap;

use error_stack::Report;
use gridmill_tracker::batch::FileMap;
use nalgebra::{DVector, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed input deck: {0}")]
    Input(String),
    #[error("malformed job output: {0}")]
    Output(String),
    #[error("expected output file {0} is missing")]
    MissingOutput(String),
}

/// A molecular geometry: element symbols plus Cartesian positions, in Bohr.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub symbols: Vec<String>,
    pub positions: Vec<Vector3<f64>>,
}

impl Geometry {
    /// Number of Cartesian coordinates (3 per atom).
    pub fn coordinate_count(&self) -> usize {
        3 * self.positions.len()
    }

    /// Flatten atom-major: `[x1, y1, z1, x2, ...]`.
    pub fn flatten(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.coordinate_count(),
            self.positions.iter().flat_map(|p| [p.x, p.y, p.z]),
        )
    }

    /// Rebuild positions from a flat coordinate vector.
    pub fn with_coordinates(&self, flat: &DVector<f64>) -> Geometry {
        let positions = flat
            .as_slice()
            .chunks_exact(3)
            .map(|c| Vector3::new(c[0], c[1], c[2]))
            .collect();
        Geometry {
            symbols: self.symbols.clone(),
            positions,
        }
    }
}

/// What a single-point input deck asks the application to compute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    /// Energy plus Cartesian gradient.
    Gradient,
    /// Analytic Hessian at the given geometry.
    Hessian,
}

/// Application parameters carried alongside a geometry in an input deck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobParams {
    pub title: String,
    pub kind: RunKind,
    /// Converged orbitals from an earlier run, seeded as the initial guess.
    pub orbital_guess: Option<Vec<f64>>,
    /// Backend-specific keyword groups, passed through untouched.
    pub extra: BTreeMap<String, String>,
}

/// Structured view of one finished single-point computation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinglePointOutput {
    pub energy: f64,
    /// Cartesian gradient, one entry per atom.
    pub gradient: Vec<Vector3<f64>>,
    /// Converged orbital coefficients, when the application prints them.
    pub orbitals: Option<Vec<f64>>,
}

impl SinglePointOutput {
    /// Gradient flattened atom-major, matching [`Geometry::flatten`].
    pub fn gradient_flat(&self) -> DVector<f64> {
        DVector::from_iterator(
            3 * self.gradient.len(),
            self.gradient.iter().flat_map(|g| [g.x, g.y, g.z]),
        )
    }
}

/// Reads and writes the application's text formats. Implementations are pure
/// functions of the bytes; anything stateful belongs in the batch client.
pub trait SinglePointCodec: Send + Sync {
    fn parse_input(&self, bytes: &[u8]) -> Result<(Geometry, JobParams), Report<CodecError>>;

    fn write_input(
        &self,
        geometry: &Geometry,
        params: &JobParams,
    ) -> Result<Vec<u8>, Report<CodecError>>;

    /// Extract the structured result from a run's retrieved output files.
    fn parse_output(&self, files: &FileMap) -> Result<SinglePointOutput, Report<CodecError>>;
}
