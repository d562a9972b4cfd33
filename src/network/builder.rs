//! Synthetic networks for benchmarks, tests and the CLI.

use super::Twoport;

/// Parameters of one equivalent-circuit cell: `R_s + (C || R_p)`.
#[derive(Debug, Clone, Copy)]
pub struct CellParameters {
    /// Series resistance (ohms).
    pub series_resistance: f64,
    /// Capacitance of the RC element (farads).
    pub capacitance: f64,
    /// Resistance of the RC element (ohms).
    pub parallel_resistance: f64,
}

impl Default for CellParameters {
    fn default() -> Self {
        Self {
            series_resistance: 1.5e-3,
            capacitance: 2.0e3,
            parallel_resistance: 2.5e-3,
        }
    }
}

/// One cell, observable at the cell level.
pub fn cell(params: &CellParameters) -> Twoport {
    Twoport::serial(vec![
        Twoport::resistor(params.series_resistance),
        Twoport::parallel(vec![
            Twoport::capacitance(params.capacitance),
            Twoport::resistor(params.parallel_resistance),
        ]),
    ])
    .observed()
}

/// `branches` parallel strings of `cells` serial cells each.
pub fn battery_pack(branches: usize, cells: usize, params: &CellParameters) -> Twoport {
    Twoport::parallel(
        (0..branches)
            .map(|_| Twoport::serial((0..cells).map(|_| cell(params)).collect()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::StateSystemGroup;

    #[test]
    fn test_pack_sizes() {
        let mut pack = battery_pack(3, 4, &CellParameters::default());
        assert_eq!(pack.element_count(), 36);
        assert_eq!(pack.observable_paths().len(), 12);

        let mut systems = StateSystemGroup::new();
        pack.set_system(&mut systems).unwrap();
        // one capacitance per cell; one Alg row per RC element plus two for the branches
        assert_eq!(systems.dgl.equation_count(), 12);
        assert_eq!(systems.alg.equation_count(), 14);
    }
}
