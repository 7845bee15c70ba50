use crate::error::PeerError;
use crate::peer::link::PeerConnection;
use crate::peer::types::IceCandidate;
use tracing::{debug, info, warn};

/// Применяет отложенные кандидаты после установки remote description.
/// Очередь забирается целиком: после первой ошибки оставшиеся кандидаты
/// отбрасываются вместе с ней.
pub async fn apply_pending_candidates(
    conn: &dyn PeerConnection,
    pending: &mut Vec<IceCandidate>,
) -> Result<usize, PeerError> {
    let mut applied = 0;
    for candidate in pending.drain(..) {
        debug!("Applying pending candidate: {}", candidate.candidate);
        conn.add_ice_candidate(candidate).await?;
        applied += 1;
    }
    Ok(applied)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        summary.host, summary.srflx, summary.relay
    );

    if summary.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    summary
}
