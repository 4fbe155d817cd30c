//! Incremental decode session for the streaming backend.
//!
//! The model keeps its KV cache between calls; this session tracks how far
//! that cache reaches so the next prompt is fed at the right position.
//! Lifecycle: closed -> open on the first turn -> advanced after every turn ->
//! reset explicitly (or when the next turn would overflow the window).

/// Where the KV cache stands between turns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Closed,
    Open {
        /// Tokens already in the cache
        offset: usize,
        /// Last sampled token, not yet fed to the model
        pending: Option<u32>,
    },
}

/// Input for one turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTurn {
    /// Position of the first token in `input`
    pub start_pos: usize,
    /// Tokens to feed: the pending token (if any) followed by the prompt
    pub input: Vec<u32>,
    /// The cache must be cleared before feeding
    pub fresh: bool,
}

#[derive(Debug, Clone)]
pub struct DecodeSession {
    state: SessionState,
    max_length: usize,
}

impl DecodeSession {
    pub fn new(max_length: usize) -> Self {
        Self {
            state: SessionState::Closed,
            max_length,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, SessionState::Open { .. })
    }

    /// Tokens currently held in the cache
    pub fn offset(&self) -> usize {
        match self.state {
            SessionState::Closed => 0,
            SessionState::Open { offset, .. } => offset,
        }
    }

    /// Prepare the next turn, opening (or reopening on overflow) as needed.
    pub fn begin(&mut self, prompt: &[u32], max_new_tokens: usize) -> SessionTurn {
        if let SessionState::Open { offset, pending } = self.state {
            let carried = usize::from(pending.is_some());
            let needed = offset + carried + prompt.len() + max_new_tokens;
            if needed <= self.max_length {
                let mut input = Vec::with_capacity(carried + prompt.len());
                input.extend(pending);
                input.extend_from_slice(prompt);
                return SessionTurn {
                    start_pos: offset,
                    input,
                    fresh: false,
                };
            }
            tracing::warn!(
                "Decode session would exceed {} tokens ({} needed), starting a new one",
                self.max_length,
                needed
            );
        }

        self.state = SessionState::Open {
            offset: 0,
            pending: None,
        };
        SessionTurn {
            start_pos: 0,
            input: prompt.to_vec(),
            fresh: true,
        }
    }

    /// Record a finished turn.
    ///
    /// `generated` holds every sampled token; all but the last were fed back
    /// into the model, the last one stays pending for the next turn.
    pub fn advance(&mut self, turn: &SessionTurn, generated: &[u32]) {
        let fed = turn.input.len() + generated.len().saturating_sub(1);
        self.state = SessionState::Open {
            offset: turn.start_pos + fed,
            pending: generated.last().copied(),
        };
    }

    /// Close the session; the next turn starts from an empty cache.
    pub fn reset(&mut self) {
        self.state = SessionState::Closed;
    }
}
