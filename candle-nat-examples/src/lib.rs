use std::collections::HashMap;

use candle::utils::{cuda_is_available, metal_is_available};
use candle::{Device, Result, Tensor};

pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            println!(
                "Running on CPU, to run on GPU(metal), build this example with `--features metal`"
            );
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            println!("Running on CPU, to run on GPU, build this example with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

pub const BOS: &str = "<s>";
pub const PAD: &str = "<pad>";
pub const EOS: &str = "</s>";
pub const UNK: &str = "<unk>";
pub const BLANK: &str = "<blank>";

/// Symbol table in the fairseq `dict.txt` layout: `<s> <pad> </s> <unk>`
/// followed by one `symbol count` entry per line, optionally closed by `<blank>`.
#[derive(Debug, Clone)]
pub struct Vocab {
    symbols: Vec<String>,
    indices: HashMap<String, u32>,
    blank: Option<u32>,
}

impl Vocab {
    pub fn from_dict_str(dict: &str, with_blank: bool) -> Self {
        let mut vocab = Self {
            symbols: vec![],
            indices: HashMap::new(),
            blank: None,
        };
        for special in [BOS, PAD, EOS, UNK] {
            vocab.add_symbol(special);
        }
        for line in dict.lines() {
            if let Some(symbol) = line.split_whitespace().next() {
                vocab.add_symbol(symbol);
            }
        }
        if with_blank {
            vocab.blank = Some(vocab.add_symbol(BLANK));
        }
        vocab
    }

    pub fn from_dict_file<P: AsRef<std::path::Path>>(path: P, with_blank: bool) -> Result<Self> {
        let dict = std::fs::read_to_string(path)?;
        Ok(Self::from_dict_str(&dict, with_blank))
    }

    fn add_symbol(&mut self, symbol: &str) -> u32 {
        if let Some(&idx) = self.indices.get(symbol) {
            return idx;
        }
        let idx = self.symbols.len() as u32;
        self.symbols.push(symbol.to_string());
        self.indices.insert(symbol.to_string(), idx);
        idx
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn blank(&self) -> Option<u32> {
        self.blank
    }

    pub fn index(&self, symbol: &str) -> u32 {
        self.indices.get(symbol).copied().unwrap_or(3)
    }

    /// Whitespace tokens of `line` followed by `</s>`.
    pub fn encode(&self, line: &str) -> Vec<u32> {
        line.split_whitespace()
            .map(|symbol| self.index(symbol))
            .chain(std::iter::once(self.index(EOS)))
            .collect()
    }

    /// Join the non-special symbols and undo `@@ ` subword splits.
    pub fn decode(&self, tokens: &[u32]) -> String {
        let specials = [BOS, PAD, EOS, BLANK].map(|s| self.indices.get(s).copied());
        tokens
            .iter()
            .filter(|&&t| !specials.contains(&Some(t)))
            .filter_map(|&t| self.symbols.get(t as usize).map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
            .replace("@@ ", "")
    }

    /// Encode every line and right-pad into a `[B, S]` batch.
    pub fn batch(&self, lines: &[String], device: &Device) -> Result<Tensor> {
        let encoded: Vec<Vec<u32>> = lines.iter().map(|l| self.encode(l)).collect();
        let max_len = encoded.iter().map(|e| e.len()).max().unwrap_or(1);
        let pad = self.index(PAD);
        let mut data = Vec::with_capacity(encoded.len() * max_len);
        for tokens in encoded.iter() {
            data.extend_from_slice(tokens);
            data.extend(std::iter::repeat_n(pad, max_len - tokens.len()));
        }
        Tensor::from_vec(data, (encoded.len(), max_len), device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DICT: &str = "the 100\ncat 50\nsat@@ 10\nisfied 9\n";

    #[test]
    fn test_vocab_layout() {
        let vocab = Vocab::from_dict_str(DICT, true);
        assert_eq!(vocab.len(), 9);
        assert_eq!(vocab.index(PAD), 1);
        assert_eq!(vocab.index("the"), 4);
        assert_eq!(vocab.blank(), Some(8));
        assert_eq!(vocab.index("dog"), 3);
        assert!(Vocab::from_dict_str(DICT, false).blank().is_none());
    }

    #[test]
    fn test_encode_decode() -> Result<()> {
        let vocab = Vocab::from_dict_str(DICT, true);
        assert_eq!(vocab.encode("the cat"), [4, 5, 2]);
        assert_eq!(vocab.decode(&[0, 4, 5, 8, 6, 7, 2, 1]), "the cat satisfied");

        let batch = vocab.batch(&["the cat".to_string(), "cat".to_string()], &Device::Cpu)?;
        assert_eq!(batch.to_vec2::<u32>()?, [[4, 5, 2], [5, 2, 1]]);
        Ok(())
    }
}
