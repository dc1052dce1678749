//! JSON codec plus an analytic harmonic-oscillator model. Together they
//! stand in for a real quantum-chemistry application: the codec round-trips
//! decks and results as JSON, and the model answers every gradient request
//! from `V(x) = x' K x / 2`, whose exact Hessian is the spring matrix `K`
//! itself. The test suite and the demo binary run entire workflows against
//! them without touching an external code.

use error_stack::Report;
use gridmill_tracker::batch::{BatchError, FileMap};
use nalgebra::{DMatrix, DVector, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{event, Level};

use crate::codec::{CodecError, Geometry, JobParams, SinglePointCodec, SinglePointOutput};
use crate::workflow::BOHR_PER_ANGSTROM;

/// Output file every harmonic job produces.
pub const RESULT_FILE: &str = "result.json";

#[derive(Debug, Serialize, Deserialize)]
struct InputDeck {
    geometry: Geometry,
    params: JobParams,
}

/// Input decks and results as plain JSON documents.
pub struct JsonCodec;

impl SinglePointCodec for JsonCodec {
    fn parse_input(&self, bytes: &[u8]) -> Result<(Geometry, JobParams), Report<CodecError>> {
        let deck: InputDeck = serde_json::from_slice(bytes)
            .map_err(|e| Report::new(CodecError::Input(e.to_string())))?;
        Ok((deck.geometry, deck.params))
    }

    fn write_input(
        &self,
        geometry: &Geometry,
        params: &JobParams,
    ) -> Result<Vec<u8>, Report<CodecError>> {
        let deck = InputDeck {
            geometry: geometry.clone(),
            params: params.clone(),
        };
        serde_json::to_vec_pretty(&deck).map_err(|e| Report::new(CodecError::Input(e.to_string())))
    }

    fn parse_output(&self, files: &FileMap) -> Result<SinglePointOutput, Report<CodecError>> {
        let bytes = files
            .get(RESULT_FILE)
            .ok_or_else(|| Report::new(CodecError::MissingOutput(RESULT_FILE.to_string())))?;
        serde_json::from_slice(bytes).map_err(|e| Report::new(CodecError::Output(e.to_string())))
    }
}

/// Analytic model with potential `V(x) = x' K x / 2`.
#[derive(Debug, Clone)]
pub struct HarmonicModel {
    stiffness: DMatrix<f64>,
}

impl HarmonicModel {
    pub fn new(stiffness: DMatrix<f64>) -> Self {
        debug_assert_eq!(stiffness.nrows(), stiffness.ncols());
        Self { stiffness }
    }

    pub fn stiffness(&self) -> &DMatrix<f64> {
        &self.stiffness
    }

    /// Gradient in the application's units (the workflow divides the
    /// assembled matrix by the same conversion).
    fn gradient(&self, coords: &DVector<f64>) -> DVector<f64> {
        (&self.stiffness * coords) * BOHR_PER_ANGSTROM
    }

    /// Play the batch system for one submitted deck: parse it, evaluate the
    /// analytic gradient at its geometry, and emit [`RESULT_FILE`].
    pub fn run_deck(&self, files: &FileMap) -> Result<FileMap, BatchError> {
        let bytes = files.values().next().ok_or(BatchError::SubmitFailed)?;
        let deck: InputDeck = serde_json::from_slice(bytes).map_err(|e| {
            event!(Level::WARN, error = %e, "harmonic model rejected deck");
            BatchError::SubmitFailed
        })?;

        let coords = deck.geometry.flatten();
        if coords.len() != self.stiffness.nrows() {
            return Err(BatchError::SubmitFailed);
        }
        let flat = self.gradient(&coords);
        let gradient: Vec<Vector3<f64>> = flat
            .as_slice()
            .chunks_exact(3)
            .map(|g| Vector3::new(g[0], g[1], g[2]))
            .collect();
        let output = SinglePointOutput {
            energy: 0.5 * coords.dot(&(&self.stiffness * &coords)),
            gradient,
            orbitals: Some(vec![1.0; coords.len()]),
        };

        let mut out = FileMap::new();
        out.insert(
            RESULT_FILE.to_string(),
            serde_json::to_vec(&output).map_err(|_| BatchError::FetchFailed)?,
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RunKind;

    fn geometry() -> Geometry {
        Geometry {
            symbols: vec!["H".to_string()],
            positions: vec![Vector3::new(0.1, -0.2, 0.3)],
        }
    }

    #[test]
    fn deck_round_trips() {
        let params = JobParams {
            title: "probe".to_string(),
            kind: RunKind::Gradient,
            orbital_guess: Some(vec![0.5, 0.5]),
            extra: Default::default(),
        };
        let bytes = JsonCodec.write_input(&geometry(), &params).unwrap();
        let (parsed_geometry, parsed_params) = JsonCodec.parse_input(&bytes).unwrap();
        assert_eq!(parsed_geometry, geometry());
        assert_eq!(parsed_params.title, "probe");
        assert_eq!(parsed_params.orbital_guess, Some(vec![0.5, 0.5]));
    }

    #[test]
    fn model_emits_the_analytic_gradient() {
        let stiffness = DMatrix::identity(3, 3) * 2.0;
        let model = HarmonicModel::new(stiffness);
        let params = JobParams {
            title: "probe".to_string(),
            kind: RunKind::Gradient,
            orbital_guess: None,
            extra: Default::default(),
        };
        let deck = JsonCodec.write_input(&geometry(), &params).unwrap();
        let mut files = FileMap::new();
        files.insert("input.inp".to_string(), deck);

        let outputs = model.run_deck(&files).unwrap();
        let result = JsonCodec.parse_output(&outputs).unwrap();
        let expected = Vector3::new(0.1, -0.2, 0.3) * 2.0 * BOHR_PER_ANGSTROM;
        assert!((result.gradient[0] - expected).norm() < 1e-12);
    }

    #[test]
    fn missing_result_file_is_reported() {
        let err = JsonCodec.parse_output(&FileMap::new()).unwrap_err();
        assert!(matches!(
            err.current_context(),
            CodecError::MissingOutput(_)
        ));
    }
}
