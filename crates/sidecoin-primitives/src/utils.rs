/// Shuffles `items` in place with the caller supplied generator.
///
/// Fisher-Yates: walks down to index 1, the first element still moves when it is picked as
/// a swap target. Passing a seeded [`fastrand::Rng`] makes the permutation reproducible.
pub fn shuffle<T>(items: &mut [T], rng: &mut fastrand::Rng) {
    for i in (1..items.len()).rev() {
        let j = rng.usize(..=i);
        items.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_permutation() {
        let mut a = (0..32).collect::<Vec<u32>>();
        let mut b = a.clone();
        shuffle(&mut a, &mut fastrand::Rng::with_seed(42));
        shuffle(&mut b, &mut fastrand::Rng::with_seed(42));
        assert_eq!(a, b);

        let mut sorted = a.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..32).collect::<Vec<u32>>());
    }

    #[test]
    fn first_element_can_move() {
        let moved = (0..64).any(|seed| {
            let mut items = [0u8, 1, 2, 3];
            shuffle(&mut items, &mut fastrand::Rng::with_seed(seed));
            items[0] != 0
        });
        assert!(moved);
    }
}
