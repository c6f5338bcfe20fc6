//! Runs a handful of loan applications against simulated back-office systems.
//!
//! Time is paused and auto-advanced by tokio, so the seven day approval window
//! and the follow-up schedule play out instantly.
//!
//! `RUST_LOG=loan_origination=debug cargo run --example simulate`

use async_trait::async_trait;
use loan_origination::{
    ActivityError, Applicant, Case, CaseStatus, Disbursement, DisbursementStatus, Document,
    DocumentKind, DocumentValidation, LoanActivities, Notification, Orchestrator,
    OrchestratorConfig, RiskAssessment, RiskLevel, TokioClock, telemetry,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Back office that scores on debt-to-income and flakes once on the payment rail.
struct SimulatedBackOffice {
    rail_calls: AtomicU32,
}

#[async_trait]
impl LoanActivities for SimulatedBackOffice {
    async fn validate_documents(&self, case: &Case) -> Result<DocumentValidation, ActivityError> {
        let has_income = case
            .documents
            .iter()
            .any(|d| d.kind == DocumentKind::ProofOfIncome);
        Ok(if has_income {
            DocumentValidation::accepted()
        } else {
            DocumentValidation::refused("proof of income missing")
        })
    }

    async fn score_risk(&self, case: &Case) -> Result<RiskAssessment, ActivityError> {
        let applicant = &case.applicant;
        let monthly_income = (applicant.annual_income / 12).max(1);
        let ratio = applicant.monthly_debt as f64 / monthly_income as f64;
        let (risk_level, score) = match ratio {
            r if r < 0.2 => (RiskLevel::Low, 780),
            r if r < 0.35 => (RiskLevel::Medium, 690),
            r if r < 0.5 => (RiskLevel::High, 610),
            _ => (RiskLevel::VeryHigh, 480),
        };
        Ok(RiskAssessment {
            case_id: case.case_id.clone(),
            score,
            risk_level,
            debt_to_income_ratio: ratio,
            risk_factors: if ratio >= 0.35 {
                vec!["high debt to income".into()]
            } else {
                vec![]
            },
        })
    }

    async fn disburse_funds(
        &self,
        case: &Case,
        idempotency_key: &str,
    ) -> Result<Disbursement, ActivityError> {
        if self.rail_calls.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(ActivityError::Transient("payment rail timeout".into()));
        }
        Ok(Disbursement {
            transaction_id: format!("txn_{}", &idempotency_key[..12]),
            amount: case.requested_amount,
            status: DisbursementStatus::Completed,
            failure_reason: None,
        })
    }

    async fn compensate_disbursement(
        &self,
        _case_id: &str,
        _idempotency_key: &str,
    ) -> Result<(), ActivityError> {
        Ok(())
    }

    async fn send_notification(&self, notification: &Notification) -> Result<(), ActivityError> {
        println!("  -> {} notified: {:?}", notification.user_id, notification.kind);
        Ok(())
    }
}

fn application(name: &str, annual_income: u64, monthly_debt: u64, with_income: bool) -> anyhow::Result<Case> {
    let mut documents = vec![Document {
        document_id: format!("{name}_id"),
        kind: DocumentKind::Identity,
        reference: format!("docs/{name}/passport.pdf"),
    }];
    if with_income {
        documents.push(Document {
            document_id: format!("{name}_income"),
            kind: DocumentKind::ProofOfIncome,
            reference: format!("docs/{name}/payslip.pdf"),
        });
    }
    Case::new(
        Applicant {
            user_id: loan_origination::utils::new_uuid_to_bech32("user_")?,
            full_name: name.to_string(),
            email: format!("{}@example.com", name.to_lowercase()),
            annual_income,
            monthly_debt,
        },
        1_500_000,
        documents,
    )
}

#[tokio::main(flavor = "current_thread", start_paused = true)]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("loan_origination=info")?;

    let temp_dir = tempfile::tempdir()?;
    let db = Arc::new(sled::open(temp_dir.path().join("simulate.db"))?);
    let mut config = OrchestratorConfig::default();
    config.follow_up.max_cycles = Some(1);

    let orchestrator = Orchestrator::new(
        db,
        Arc::new(SimulatedBackOffice {
            rail_calls: AtomicU32::new(0),
        }),
        Arc::new(TokioClock::new()),
        config,
    )?;

    let approved = application("Ada", 9_000_000, 100_000, true)?;
    let unreadable = application("Charles", 7_000_000, 80_000, false)?;
    let overextended = application("Edsger", 3_000_000, 200_000, true)?;
    let forgotten = application("Barbara", 8_000_000, 150_000, true)?;

    let mut running = vec![];
    for case in [approved.clone(), unreadable, overextended, forgotten] {
        let orchestrator = orchestrator.clone();
        let case_id = case.case_id.clone();
        running.push((case_id, tokio::spawn(async move { orchestrator.process_case(case).await })));
    }

    // an officer signs off on the first application once it is ready
    let mut query = loop {
        if let Ok(query) = orchestrator.query(&approved.case_id).await {
            break query;
        }
        tokio::task::yield_now().await;
    };
    if query.wait_for_status(CaseStatus::AwaitingApproval).await {
        orchestrator
            .request_more_info(approved.case_id.clone(), "latest payslip".into())
            .await?;
        orchestrator
            .approve(approved.case_id.clone(), "officer_grace".into(), None)
            .await?;
    }

    for (case_id, handle) in running {
        let outcome = handle.await??;
        println!("\n{case_id}: {outcome:?}");
        for entry in orchestrator.query(&case_id).await?.processing_history().iter() {
            println!("  {} {}", entry.timestamp.to_datetime_utc().format("%F %T"), entry.message);
        }
    }

    // let the single follow-up cycle of the disbursed case run out
    while orchestrator.store().load_cursor(&approved.case_id)?.is_some() {
        tokio::time::sleep(std::time::Duration::from_secs(30 * 24 * 60 * 60)).await;
    }
    println!("\nfollow-up schedule for {} complete", approved.case_id);

    Ok(())
}
