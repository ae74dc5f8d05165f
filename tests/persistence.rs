use approx::assert_abs_diff_eq;
use ndarray as nd;
use rand::{ SeedableRng, rngs::StdRng };
use mps_learn::{
    Basis, BasisArgs, EncodedDataset, Split, SweepOpts, Trainer,
    mps::MPS,
    sampling::{ Fill, Sampler },
};

fn ramp_data() -> (nd::Array2<f64>, Vec<usize>) {
    let data =
        nd::Array2::from_shape_fn((8, 4), |(i, k)| {
            if i < 4 { 0.1 + 0.02 * (i + k) as f64 } else { 0.9 - 0.02 * (i + k) as f64 }
        });
    let labels: Vec<usize> = (0..8).map(|i| usize::from(i >= 4)).collect();
    (data, labels)
}

fn trained() -> MPS<f64> {
    let (data, labels) = ramp_data();
    let opts = SweepOpts {
        nsweeps: 1,
        chi_max: 4,
        chi_init: 2,
        d: 2,
        basis: Basis::Angle,
        eta: 0.1,
        seed: Some(77),
        num_threads: Some(1),
        ..SweepOpts::default()
    };
    let mut trainer: Trainer<f64> =
        Trainer::from_raw(opts, (&data, labels.as_slice()), None, None).unwrap();
    trainer.train().unwrap();
    let (mps, _) = trainer.into_parts();
    mps.unwrap()
}

#[test]
fn trained_network_survives_json_round_trip() {
    let mps = trained();
    let path = std::env::temp_dir().join("mps_learn_trained_round_trip.json");
    mps.save(&path).unwrap();
    let loaded: MPS<f64> = MPS::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(loaded.len(), mps.len());
    assert_eq!(loaded.label_site(), mps.label_site());
    assert_eq!(loaded.bond_dims(), mps.bond_dims());

    let (data, labels) = ramp_data();
    let ds: EncodedDataset<f64> =
        EncodedDataset::encode(&data, &labels, &Basis::Angle, &BasisArgs::Empty, 2, Split::Test)
        .unwrap();
    for state in ds.states() {
        let a = mps.amplitudes(state).unwrap();
        let b = loaded.amplitudes(state).unwrap();
        for (x, y) in a.iter().zip(&b) {
            assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
        }
    }
}

#[test]
fn class_slices_can_be_sampled_and_conditioned() {
    let mps = trained();
    let mut rng = StdRng::seed_from_u64(3);
    for class in 0..2 {
        let sliced = mps.class_slice(class).unwrap();
        let sampler = Sampler::new(&sliced, Basis::Angle, BasisArgs::Empty, 41).unwrap();
        let xs = sampler.sample(&mut rng).unwrap();
        assert_eq!(xs.len(), 4);
        assert!(xs.iter().all(|x| (0.0..=1.0).contains(x)));

        let forecast = sampler.forecast(&[0.5], Fill::Mean, &mut rng).unwrap();
        assert_eq!(forecast[0], 0.5);
        assert!(forecast[1..].iter().all(|x| (0.0..=1.0).contains(x)));

        let imputed =
            sampler.fill(&[None, Some(0.3), None, Some(0.6)], Fill::Sample, &mut rng)
            .unwrap();
        assert_eq!((imputed[1], imputed[3]), (0.3, 0.6));
    }
}
