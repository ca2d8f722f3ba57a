use super::{
    endpoint::EndpointInner,
    transaction::{Transaction, TransactionState, TransactionStep, TransactionTimer},
};
use crate::{
    sip::{Method, Request, Response},
    Error, Result,
};
use std::cmp::min;

pub(super) fn on_request(
    tx: &mut Transaction,
    endpoint: &EndpointInner,
    req: Request,
) -> TransactionStep {
    match (&req.method, tx.state) {
        (Method::Invite, TransactionState::Proceeding | TransactionState::Completed) => {
            match &tx.last_response {
                Some(resp) => TransactionStep::send(resp.clone()),
                None => TransactionStep::default(),
            }
        }
        (Method::Ack, TransactionState::Completed) => {
            tx.cancel_timers(endpoint);
            tx.state = TransactionState::Confirmed;
            if tx.reliable {
                tx.state = TransactionState::Terminated;
                return TransactionStep::terminate();
            }
            let timer_i = endpoint.option.t4;
            tx.arm_timeout(endpoint, TransactionTimer::TimerI(tx.key.clone()), timer_i);
            TransactionStep::default()
        }
        // an ACK for the 2xx reusing the INVITE branch
        (Method::Ack, TransactionState::Accepted) => TransactionStep {
            deliver_ack: Some(req),
            ..Default::default()
        },
        _ => TransactionStep::default(),
    }
}

pub(super) fn respond(
    tx: &mut Transaction,
    endpoint: &EndpointInner,
    resp: Response,
) -> Result<TransactionStep> {
    match tx.state {
        TransactionState::Proceeding => {
            if resp.is_success() {
                tx.state = TransactionState::Accepted;
                let timer_l = endpoint.option.t1 * 64;
                tx.arm_timeout(endpoint, TransactionTimer::TimerL(tx.key.clone()), timer_l);
            } else if resp.is_final() {
                tx.state = TransactionState::Completed;
                if !tx.reliable {
                    tx.interval = endpoint.option.t1;
                    tx.arm_retransmit(endpoint, TransactionTimer::TimerG(tx.key.clone()));
                }
                let timer_h = endpoint.option.t1 * 64;
                tx.arm_timeout(endpoint, TransactionTimer::TimerH(tx.key.clone()), timer_h);
            }
            tx.last_response = Some(resp.clone());
            Ok(TransactionStep::send(resp))
        }
        // the dialog retransmits its 2xx until the ACK arrives
        TransactionState::Accepted if resp.is_success() => Ok(TransactionStep::send(resp)),
        state => Err(Error::TransactionError(
            format!("cannot send {} in {}", resp.status, state),
            tx.key.clone(),
        )),
    }
}

pub(super) fn on_timer(
    tx: &mut Transaction,
    endpoint: &EndpointInner,
    timer: &TransactionTimer,
) -> TransactionStep {
    match (timer, tx.state) {
        (TransactionTimer::TimerG(key), TransactionState::Completed) => {
            tx.interval = min(tx.interval * 2, endpoint.option.t2);
            tx.arm_retransmit(endpoint, TransactionTimer::TimerG(key.clone()));
            match &tx.last_response {
                Some(resp) => TransactionStep::send(resp.clone()),
                None => TransactionStep::default(),
            }
        }
        (TransactionTimer::TimerH(_), TransactionState::Completed) => {
            tracing::warn!(key = %tx.key, "no ACK for final response");
            tx.cancel_timers(endpoint);
            tx.state = TransactionState::Terminated;
            TransactionStep::terminate()
        }
        (TransactionTimer::TimerI(_), TransactionState::Confirmed)
        | (TransactionTimer::TimerL(_), TransactionState::Accepted) => {
            tx.cancel_timers(endpoint);
            tx.state = TransactionState::Terminated;
            TransactionStep::terminate()
        }
        _ => TransactionStep::default(),
    }
}
