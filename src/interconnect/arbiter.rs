use std::collections::VecDeque;

#[derive(Debug)]
struct ClassQueue<T> {
    weight: u32,
    credits: u32,
    queue: VecDeque<T>,
}

/// Weighted round robin over QoS classes. Each class may take `weight` grants per round, FIFO
/// within the class; a new round starts once no backlogged class has credit left. Every class
/// with a nonzero weight is served at least once per round.
#[derive(Debug)]
pub struct QosArbiter<T> {
    classes: Vec<ClassQueue<T>>,
    capacity: usize,
    cursor: usize,
}

impl<T> QosArbiter<T> {
    pub fn new(weights: &[u32], capacity: usize) -> Self {
        Self {
            classes: weights
                .iter()
                .map(|&weight| ClassQueue {
                    weight,
                    credits: weight,
                    queue: VecDeque::new(),
                })
                .collect(),
            capacity,
            cursor: 0,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Queue `item` in `class`. Hands it back when that class's queue is full.
    pub fn try_push(&mut self, class: usize, item: T) -> Result<(), T> {
        match self.classes.get_mut(class) {
            Some(c) if c.queue.len() < self.capacity => {
                c.queue.push_back(item);
                Ok(())
            }
            _ => Err(item),
        }
    }

    pub fn grant(&mut self) -> Option<(usize, T)> {
        if self.is_empty() {
            return None;
        }
        let n = self.classes.len();
        loop {
            for i in 0..n {
                let idx = (self.cursor + i) % n;
                let class = &mut self.classes[idx];
                if class.credits == 0 {
                    continue;
                }
                if let Some(item) = class.queue.pop_front() {
                    class.credits -= 1;
                    self.cursor = if class.credits == 0 { (idx + 1) % n } else { idx };
                    return Some((idx, item));
                }
            }
            for class in &mut self.classes {
                class.credits = class.weight;
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.classes.iter().all(|c| c.queue.is_empty())
    }

    pub fn queued(&self, class: usize) -> usize {
        self.classes.get(class).map_or(0, |c| c.queue.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backlog(arb: &mut QosArbiter<(usize, u32)>, per_class: u32) {
        for class in 0..arb.num_classes() {
            for i in 0..per_class {
                arb.try_push(class, (class, i)).unwrap();
            }
        }
    }

    #[test]
    fn shares_follow_weights_when_all_classes_are_backlogged() {
        let mut arb = QosArbiter::new(&[4, 2, 1], 1000);
        backlog(&mut arb, 500);
        let mut grants = [0u32; 3];
        for _ in 0..700 {
            let (class, _) = arb.grant().unwrap();
            grants[class] += 1;
        }
        assert_eq!([400, 200, 100], grants);
    }

    #[test]
    fn fifo_within_a_class() {
        let mut arb = QosArbiter::new(&[1, 1], 8);
        backlog(&mut arb, 3);
        let order: Vec<_> = std::iter::from_fn(|| arb.grant()).map(|(_, item)| item).collect();
        assert_eq!(
            vec![(0, 0), (1, 0), (0, 1), (1, 1), (0, 2), (1, 2)],
            order
        );
    }

    #[test]
    fn idle_classes_do_not_block_a_round() {
        let mut arb = QosArbiter::new(&[4, 1], 8);
        arb.try_push(1, (1, 0)).unwrap();
        arb.try_push(1, (1, 1)).unwrap();
        // class 0 still holds credit but has no work; class 1 must not stall
        assert_eq!(Some((1, (1, 0))), arb.grant());
        assert_eq!(Some((1, (1, 1))), arb.grant());
        assert_eq!(None, arb.grant());
    }

    #[test]
    fn low_weight_class_is_not_starved() {
        let mut arb = QosArbiter::new(&[8, 1], 64);
        for i in 0..64 {
            arb.try_push(0, (0, i)).unwrap();
        }
        arb.try_push(1, (1, 0)).unwrap();
        let position = std::iter::from_fn(|| arb.grant())
            .position(|(class, _)| class == 1)
            .unwrap();
        assert!(position <= 8, "class 1 granted after {position} grants");
    }

    #[test]
    fn full_class_queue_hands_item_back() {
        let mut arb = QosArbiter::new(&[1], 1);
        arb.try_push(0, 'a').unwrap();
        assert_eq!(Err('b'), arb.try_push(0, 'b'));
        assert_eq!(Err('c'), arb.try_push(5, 'c'));
    }
}
