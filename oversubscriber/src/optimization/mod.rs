mod adam;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod optimizer;

pub use adam::Adam;
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use optimizer::RowOptimizer;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gradient_descent_steps_against_the_gradient() {
        let opt = GradientDescent::new(0.5);
        let mut weights = [1., 2.];

        opt.update_row(&[2., -2.], &mut weights, &mut []).unwrap();
        assert_eq!(weights, [0., 3.]);
    }

    #[test]
    fn momentum_accumulates_velocity() {
        let opt = GradientDescentWithMomentum::new(1., 0.5);
        let mut weights = [0.];
        let mut state = [0.];

        opt.update_row(&[1.], &mut weights, &mut state).unwrap();
        assert_eq!((weights, state), ([-1.], [1.]));

        opt.update_row(&[1.], &mut weights, &mut state).unwrap();
        assert_eq!((weights, state), ([-2.5], [1.5]));
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let opt = Adam::new(0.1, 0.9, 0.999, 1e-8);
        let mut weights = [1., 1.];
        let mut state = vec![0.; opt.state_dim(2)];

        opt.update_row(&[3., -3.], &mut weights, &mut state).unwrap();

        assert!((weights[0] - 0.9).abs() < 1e-4);
        assert!((weights[1] - 1.1).abs() < 1e-4);
        assert!((state[4] - 0.9).abs() < 1e-6);
        assert!((state[5] - 0.999).abs() < 1e-6);
    }

    #[test]
    fn size_mismatches_are_rejected() {
        let opt = GradientDescentWithMomentum::new(1., 0.5);
        let mut weights = [0., 0.];

        assert!(opt.update_row(&[1.], &mut weights, &mut [0., 0.]).is_err());
        assert!(opt.update_row(&[1., 1.], &mut weights, &mut [0.]).is_err());
        let adam = Adam::new(0.1, 0.9, 0.9, 1e-8);
        assert!(adam.update_row(&[1.], &mut [0.], &mut [0.; 4]).is_ok());
    }
}
