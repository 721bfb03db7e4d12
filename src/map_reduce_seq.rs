use std::collections::HashMap;

use crate::common::{MapReduceApp, Output};

/// (file name, file contents)
pub type Input = Vec<(String, String)>;

/// In-memory MapReduce over the same apps the cluster runs; the reference
/// result a distributed run must agree with.
pub struct SequentialMapReduce {
    input: Input,
    mr_app: Box<dyn MapReduceApp>,
}

impl SequentialMapReduce {
    pub fn new(input: Input, mr_app: Box<dyn MapReduceApp>) -> Self {
        Self { input, mr_app }
    }

    pub fn run(self) -> Output {
        let intermediate_key_values = self.input.iter().fold(
            Vec::new(),
            |mut acc, (filename, contents)| {
                acc.extend(self.mr_app.map(filename, contents));
                acc
            },
        );

        let grouped_key_values: HashMap<String, Vec<String>> = intermediate_key_values
            .into_iter()
            .fold(HashMap::new(), |mut acc, pair| {
                acc.entry(pair.key).or_default().push(pair.value);
                acc
            });

        grouped_key_values
            .into_iter()
            .map(|(key, ivalues)| {
                let reduced = self.mr_app.reduce(&key, &ivalues);
                (key, reduced)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Operation;

    fn input() -> Input {
        vec![
            ("a.txt".to_string(), "the cat sat".to_string()),
            ("b.txt".to_string(), "the dog".to_string()),
        ]
    }

    #[test]
    fn word_count_scenario() {
        let output = SequentialMapReduce::new(input(), Operation::WordCount.app()).run();
        assert_eq!(output.len(), 4);
        assert_eq!(output["the"], "2");
        assert_eq!(output["cat"], "1");
        assert_eq!(output["sat"], "1");
        assert_eq!(output["dog"], "1");
    }

    #[test]
    fn inverted_index_scenario() {
        let output = SequentialMapReduce::new(input(), Operation::InvertedIndex.app()).run();
        assert_eq!(output["the"], "2 a.txt,b.txt");
        assert_eq!(output["cat"], "1 a.txt");
        assert_eq!(output["dog"], "1 b.txt");
    }
}
