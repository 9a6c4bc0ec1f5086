use super::RowInit;
use crate::storage::Key;

/// A row initializer that fills every weight with the same value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConstRowInit {
    value: f32,
}

impl ConstRowInit {
    /// Creates a new `ConstRowInit` row initializer.
    ///
    /// # Arguments
    /// * `value` - The value of every weight of a fresh row.
    ///
    /// # Returns
    /// A new `ConstRowInit` instance.
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl RowInit for ConstRowInit {
    fn fill(&self, _key: Key, weights: &mut [f32]) {
        weights.fill(self.value);
    }

    fn is_zero(&self) -> bool {
        self.value == 0.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RowDims;

    #[test]
    fn default_is_zero() {
        let row = ConstRowInit::default().fresh_row(3, RowDims::new(4, 2));
        assert_eq!(row.weights(), &[0.; 4]);
        assert_eq!(row.state(), &[0.; 2]);
        assert!(ConstRowInit::default().is_zero());
    }

    #[test]
    fn fills_only_weights() {
        let row = ConstRowInit::new(0.5).fresh_row(3, RowDims::new(2, 3));
        assert_eq!(row.weights(), &[0.5; 2]);
        assert_eq!(row.state(), &[0.; 3]);
        assert!(!ConstRowInit::new(0.5).is_zero());
    }
}
