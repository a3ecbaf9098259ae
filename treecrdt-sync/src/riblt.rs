//! Rateless invertible Bloom lookup table over 16-byte symbols.
//!
//! Set reconciliation codec: the encoder streams an unbounded sequence of
//! coded symbols (xor of member symbols, xor of their hashes, membership
//! count); the decoder subtracts its own set and peels the difference.
//! Bandwidth is proportional to the symmetric difference, not the set sizes.
//!
//! Each symbol participates in coded symbol 0 and thereafter in a
//! pseudo-random index sequence whose density decays as ~1/i, driven by a
//! multiplicative PRNG seeded from the symbol hash. Both sides derive the
//! same mapping from the symbol bytes alone.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::error::SyncError;

/// Wire size of one coded symbol: symbol ‖ hash(u64 be) ‖ count(i64 be).
pub const CODEWORD_SIZE: usize = 32;

pub type Symbol = [u8; 16];

fn symbol_hash(symbol: &Symbol) -> u64 {
    let digest = blake3::hash(symbol);
    u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"))
}

/// The decaying index sequence a symbol is mapped to.
struct RandomMapping {
    prng: u64,
    last_index: u64,
}

impl RandomMapping {
    fn new(hash: u64) -> Self {
        Self {
            prng: hash,
            last_index: 0,
        }
    }

    fn next_index(&mut self) -> u64 {
        self.prng = self.prng.wrapping_mul(0xda94_2042_e4dd_58b5);
        let r = self.prng as f64;
        let step = ((self.last_index as f64 + 1.5) * (((1u64 << 32) as f64) / (r + 1.0).sqrt() - 1.0)).ceil();
        self.last_index = self.last_index.saturating_add(step.max(1.0) as u64);
        self.last_index
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CodedSymbol {
    pub symbol: Symbol,
    pub hash: u64,
    pub count: i64,
}

impl CodedSymbol {
    fn apply(&mut self, symbol: &Symbol, hash: u64, direction: i64) {
        for (a, b) in self.symbol.iter_mut().zip(symbol) {
            *a ^= b;
        }
        self.hash ^= hash;
        self.count += direction;
    }

    fn is_zero(&self) -> bool {
        self.count == 0 && self.hash == 0 && self.symbol == [0u8; 16]
    }

    /// A pure cell holds exactly one symbol (in either direction).
    fn is_pure(&self) -> bool {
        (self.count == 1 || self.count == -1) && self.hash == symbol_hash(&self.symbol)
    }

    pub fn encode(&self) -> [u8; CODEWORD_SIZE] {
        let mut out = [0u8; CODEWORD_SIZE];
        out[..16].copy_from_slice(&self.symbol);
        out[16..24].copy_from_slice(&self.hash.to_be_bytes());
        out[24..].copy_from_slice(&self.count.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SyncError> {
        if bytes.len() != CODEWORD_SIZE {
            return Err(SyncError::Codec(format!(
                "codeword must be {CODEWORD_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let mut symbol = [0u8; 16];
        symbol.copy_from_slice(&bytes[..16]);
        Ok(Self {
            symbol,
            hash: u64::from_be_bytes(bytes[16..24].try_into().expect("8 bytes")),
            count: i64::from_be_bytes(bytes[24..32].try_into().expect("8 bytes")),
        })
    }
}

/// Streams coded symbols for a fixed local set.
#[derive(Default)]
pub struct Encoder {
    symbols: Vec<(Symbol, u64)>,
    mappings: Vec<RandomMapping>,
    /// (next cell index, symbol index) min-heap.
    queue: BinaryHeap<Reverse<(u64, usize)>>,
    next_cell: u64,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_symbol(&mut self, symbol: Symbol) {
        let hash = symbol_hash(&symbol);
        let index = self.symbols.len();
        self.symbols.push((symbol, hash));
        self.mappings.push(RandomMapping::new(hash));
        self.queue.push(Reverse((0, index)));
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Produce the next coded symbol in the stream.
    pub fn next_codeword(&mut self) -> CodedSymbol {
        let cell_index = self.next_cell;
        let mut cell = CodedSymbol::default();
        while let Some(Reverse((index, symbol_index))) = self.queue.peek().copied() {
            if index != cell_index {
                break;
            }
            self.queue.pop();
            let (symbol, hash) = self.symbols[symbol_index];
            cell.apply(&symbol, hash, 1);
            let next = self.mappings[symbol_index].next_index();
            self.queue.push(Reverse((next, symbol_index)));
        }
        self.next_cell += 1;
        cell
    }
}

/// Accumulates the local set and the remote coded-symbol stream, and peels
/// the symmetric difference.
#[derive(Default)]
pub struct Decoder {
    local: Vec<(Symbol, u64)>,
    received: Vec<CodedSymbol>,
    decoded: bool,
    /// Symbols only we have (the remote is missing them).
    remote_missing: Vec<Symbol>,
    /// Symbols only the remote has (we are missing them).
    local_missing: Vec<Symbol>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a member of the local set. Must happen before decoding.
    pub fn add_symbol(&mut self, symbol: Symbol) {
        let hash = symbol_hash(&symbol);
        self.local.push((symbol, hash));
    }

    /// Add one received coded symbol.
    pub fn add_codeword(&mut self, codeword: CodedSymbol) {
        self.received.push(codeword);
    }

    pub fn codewords_received(&self) -> u64 {
        self.received.len() as u64
    }

    pub fn is_decoded(&self) -> bool {
        self.decoded
    }

    pub fn remote_missing(&self) -> &[Symbol] {
        &self.remote_missing
    }

    pub fn local_missing(&self) -> &[Symbol] {
        &self.local_missing
    }

    /// Subtract `symbol` from every cell of `cells` it maps into.
    /// `direction` is -1 to remove a remote-only symbol, +1 for local-only.
    fn peel_symbol(cells: &mut [CodedSymbol], symbol: &Symbol, hash: u64, direction: i64, touched: &mut Vec<usize>) {
        let n = cells.len() as u64;
        let mut mapping = RandomMapping::new(hash);
        let mut index = 0u64;
        while index < n {
            cells[index as usize].apply(symbol, hash, direction);
            touched.push(index as usize);
            index = mapping.next_index();
        }
    }

    /// Attempt to decode the difference from everything received so far.
    ///
    /// Rebuilds the difference cells from scratch on each call; incremental
    /// state would have to be rewound whenever new codewords arrive after a
    /// failed attempt.
    pub fn try_decode(&mut self) -> bool {
        if self.decoded {
            return true;
        }
        if self.received.is_empty() {
            return false;
        }

        let mut cells = self.received.clone();
        let mut touched = Vec::new();
        for (symbol, hash) in &self.local {
            Self::peel_symbol(&mut cells, symbol, *hash, -1, &mut touched);
        }

        let mut remote_only = Vec::new();
        let mut local_only = Vec::new();
        let mut worklist: Vec<usize> = (0..cells.len()).collect();
        while let Some(index) = worklist.pop() {
            let cell = cells[index];
            if !cell.is_pure() {
                continue;
            }
            let symbol = cell.symbol;
            let hash = cell.hash;
            touched.clear();
            if cell.count == 1 {
                // present only in the remote set
                local_only.push(symbol);
                Self::peel_symbol(&mut cells, &symbol, hash, -1, &mut touched);
            } else {
                // present only in the local set
                remote_only.push(symbol);
                Self::peel_symbol(&mut cells, &symbol, hash, 1, &mut touched);
            }
            worklist.extend(touched.iter().copied());
        }

        if cells.iter().all(CodedSymbol::is_zero) {
            self.decoded = true;
            self.remote_missing = remote_only;
            self.local_missing = local_only;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symbol(n: u64) -> Symbol {
        let mut s = [0u8; 16];
        s[..8].copy_from_slice(&n.to_be_bytes());
        s
    }

    /// Stream codewords from `sender` into a decoder seeded with `receiver`
    /// until it decodes (or the cap is hit).
    fn reconcile(sender: &[Symbol], receiver: &[Symbol]) -> Decoder {
        let mut encoder = Encoder::new();
        for s in sender {
            encoder.add_symbol(*s);
        }
        let mut decoder = Decoder::new();
        for s in receiver {
            decoder.add_symbol(*s);
        }
        for _ in 0..4096 {
            decoder.add_codeword(encoder.next_codeword());
            if decoder.try_decode() {
                break;
            }
        }
        decoder
    }

    #[test]
    fn identical_sets_decode_immediately() {
        let set: Vec<Symbol> = (0..50).map(symbol).collect();
        let decoder = reconcile(&set, &set);
        assert!(decoder.is_decoded());
        assert!(decoder.remote_missing().is_empty());
        assert!(decoder.local_missing().is_empty());
        // identical sets cancel out in the very first cell
        assert_eq!(decoder.codewords_received(), 1);
    }

    #[test]
    fn one_sided_difference() {
        let sender: Vec<Symbol> = (0..40).map(symbol).collect();
        let receiver: Vec<Symbol> = (0..37).map(symbol).collect();
        let decoder = reconcile(&sender, &receiver);
        assert!(decoder.is_decoded());
        assert!(decoder.remote_missing().is_empty());
        let mut missing: Vec<Symbol> = decoder.local_missing().to_vec();
        missing.sort();
        assert_eq!(missing, vec![symbol(37), symbol(38), symbol(39)]);
    }

    #[test]
    fn two_sided_difference() {
        // sender has 0..45, receiver has 5..50: each side misses 5
        let sender: Vec<Symbol> = (0..45).map(symbol).collect();
        let receiver: Vec<Symbol> = (5..50).map(symbol).collect();
        let decoder = reconcile(&sender, &receiver);
        assert!(decoder.is_decoded());

        let mut remote_missing = decoder.remote_missing().to_vec();
        remote_missing.sort();
        assert_eq!(remote_missing, (45..50).map(symbol).collect::<Vec<_>>());

        let mut local_missing = decoder.local_missing().to_vec();
        local_missing.sort();
        assert_eq!(local_missing, (0..5).map(symbol).collect::<Vec<_>>());
    }

    #[test]
    fn empty_sender() {
        let receiver: Vec<Symbol> = (0..10).map(symbol).collect();
        let decoder = reconcile(&[], &receiver);
        assert!(decoder.is_decoded());
        assert_eq!(decoder.remote_missing().len(), 10);
        assert!(decoder.local_missing().is_empty());
    }

    #[test]
    fn empty_receiver() {
        let sender: Vec<Symbol> = (0..10).map(symbol).collect();
        let decoder = reconcile(&sender, &[]);
        assert!(decoder.is_decoded());
        assert!(decoder.remote_missing().is_empty());
        assert_eq!(decoder.local_missing().len(), 10);
    }

    #[test]
    fn larger_symmetric_difference() {
        let sender: Vec<Symbol> = (0..400).map(symbol).collect();
        let receiver: Vec<Symbol> = (100..500).map(symbol).collect();
        let decoder = reconcile(&sender, &receiver);
        assert!(decoder.is_decoded());
        assert_eq!(decoder.remote_missing().len(), 100);
        assert_eq!(decoder.local_missing().len(), 100);
    }

    #[test]
    fn codeword_wire_round_trip() {
        let mut encoder = Encoder::new();
        encoder.add_symbol(symbol(1));
        encoder.add_symbol(symbol(2));
        let cw = encoder.next_codeword();
        assert_eq!(CodedSymbol::decode(&cw.encode()).unwrap(), cw);
        assert!(CodedSymbol::decode(&[0u8; 31]).is_err());
    }

    #[test]
    fn first_cell_contains_every_symbol() {
        let mut encoder = Encoder::new();
        for n in 0..7 {
            encoder.add_symbol(symbol(n));
        }
        assert_eq!(encoder.next_codeword().count, 7);
    }

    #[test]
    fn not_decoded_without_enough_codewords() {
        let sender: Vec<Symbol> = (0..100).map(symbol).collect();
        let mut encoder = Encoder::new();
        for s in &sender {
            encoder.add_symbol(*s);
        }
        let mut decoder = Decoder::new();
        // receiver empty, one codeword cannot carry 100 symbols
        decoder.add_codeword(encoder.next_codeword());
        assert!(!decoder.try_decode());
    }
}
