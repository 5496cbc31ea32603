//! Customer matching and ticket association.
//!
//! Requesters are matched by email first, then phone, then name. Only a
//! match with confidence of at least [`AUTO_ASSOCIATE_MIN_CONFIDENCE`] is
//! linked automatically; creating a customer is always the caller's call.
//!
//! The maintenance passes fill in customer details from their newest
//! ticket and score each customer by the weight of their ticket history.

use serde::Serialize;
use std::collections::HashSet;

use super::TicketError;
use super::types::{Customer, CustomerStatus, NewCustomer, Priority, Ticket, TicketStatus};
use crate::constants::{ASSOCIATION_BATCH_SIZE, AUTO_ASSOCIATE_MIN_CONFIDENCE};
use crate::mail::parser::local_part;
use crate::store::{CoverageCounts, Store};

const EMAIL_CONFIDENCE: u8 = 95;
const PHONE_CONFIDENCE: u8 = 80;
const NAME_EXACT_CONFIDENCE: u8 = 90;
const NAME_CONTAINS_CONFIDENCE: u8 = 70;
const NAME_OVERLAP_MAX_CONFIDENCE: f64 = 60.0;
const MIN_PHONE_DIGITS: usize = 8;
const MIN_NAME_CHARS: usize = 3;
const NAME_RESULTS: i64 = 10;
const TICKET_BASE_VALUE: f64 = 100.0;
const SETTLED_TICKET_BONUS: f64 = 1.2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchSource {
    Email,
    Phone,
    Name,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomerMatch {
    pub customer: Customer,
    pub confidence: u8,
    pub matched_by: MatchSource,
}

/// What `auto_associate_ticket` did.
#[derive(Debug, Clone)]
pub enum Association {
    /// The ticket already had a customer.
    AlreadyLinked(i64),
    Linked(CustomerMatch),
    Created(Customer),
    Unlinked,
}

impl Association {
    pub fn customer_id(&self) -> Option<i64> {
        match self {
            Association::AlreadyLinked(id) => Some(*id),
            Association::Linked(m) => Some(m.customer.id),
            Association::Created(c) => Some(c.id),
            Association::Unlinked => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CustomerTicketStats {
    pub total: i64,
    pub open: i64,
    pub in_progress: i64,
    pub awaiting_customer: i64,
    pub resolved: i64,
    pub closed: i64,
    /// Resolved plus closed over total, as a rounded percentage.
    pub resolution_rate: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssociationSummary {
    pub scanned: usize,
    pub linked: usize,
    pub created: usize,
    pub unlinked: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnrichmentSummary {
    pub scanned: usize,
    pub updated: usize,
}

/// Result of a full customer maintenance run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ClientSyncReport {
    pub association: AssociationSummary,
    pub enrichment: EnrichmentSummary,
    pub valued: usize,
    pub coverage: CoverageCounts,
}

/// Priority-weighted sum over a ticket history. Each ticket is worth a base
/// amount scaled by its priority, with a bonus once it is resolved or closed.
pub fn potential_value(tickets: &[Ticket]) -> i64 {
    let total: f64 = tickets
        .iter()
        .map(|ticket| {
            let weight = match ticket.priority {
                Priority::Urgent => 2.0,
                Priority::High => 1.5,
                Priority::Medium => 1.0,
                Priority::Low => 0.5,
            };
            let bonus = if ticket.status.is_terminal() {
                SETTLED_TICKET_BONUS
            } else {
                1.0
            };
            TICKET_BASE_VALUE * weight * bonus
        })
        .sum();
    total.round() as i64
}

fn phone_digits(phone: &str) -> String {
    phone.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    email.contains('@').then_some(email)
}

/// Similarity score between a searched name and a stored one.
pub fn name_similarity(query: &str, candidate: &str) -> u8 {
    let query = query.trim().to_lowercase();
    let candidate = candidate.trim().to_lowercase();
    if query.is_empty() || candidate.is_empty() {
        return 0;
    }
    if query == candidate {
        return NAME_EXACT_CONFIDENCE;
    }
    if candidate.contains(&query) || query.contains(&candidate) {
        return NAME_CONTAINS_CONFIDENCE;
    }

    let query_words: HashSet<&str> = query.split_whitespace().collect();
    let candidate_words: HashSet<&str> = candidate.split_whitespace().collect();
    let shared = query_words.intersection(&candidate_words).count();
    let total = query_words.len().max(candidate_words.len());
    if shared == 0 || total == 0 {
        return 0;
    }
    (shared as f64 / total as f64 * NAME_OVERLAP_MAX_CONFIDENCE).round() as u8
}

#[derive(Clone)]
pub struct ClientAssociation {
    store: Store,
}

impl ClientAssociation {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<CustomerMatch>, TicketError> {
        let Some(email) = normalize_email(email) else {
            return Ok(None);
        };
        Ok(self
            .store
            .find_customer_by_email(&email)
            .await?
            .map(|customer| CustomerMatch {
                customer,
                confidence: EMAIL_CONFIDENCE,
                matched_by: MatchSource::Email,
            }))
    }

    pub async fn find_by_phone(&self, phone: &str) -> Result<Vec<CustomerMatch>, TicketError> {
        let digits = phone_digits(phone);
        if digits.len() < MIN_PHONE_DIGITS {
            return Ok(Vec::new());
        }

        let mut found = self.store.find_customers_by_phone(&digits).await?;
        if found.is_empty() && digits.len() >= 10 {
            // Stored numbers often lack the country or area code
            let tail = &digits[digits.len() - MIN_PHONE_DIGITS..];
            found = self.store.find_customers_by_phone(tail).await?;
        }

        Ok(found
            .into_iter()
            .map(|customer| CustomerMatch {
                customer,
                confidence: PHONE_CONFIDENCE,
                matched_by: MatchSource::Phone,
            })
            .collect())
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Vec<CustomerMatch>, TicketError> {
        let name = name.trim();
        if name.chars().count() < MIN_NAME_CHARS {
            return Ok(Vec::new());
        }

        let mut found = self.store.find_customers_by_name(name, NAME_RESULTS).await?;
        if found.is_empty()
            && let Some(word) = name
                .split_whitespace()
                .filter(|w| w.chars().count() >= MIN_NAME_CHARS)
                .max_by_key(|w| w.chars().count())
            && word != name
        {
            found = self.store.find_customers_by_name(word, NAME_RESULTS).await?;
        }

        let mut matches: Vec<CustomerMatch> = found
            .into_iter()
            .map(|customer| {
                let confidence = name_similarity(name, &customer.name);
                CustomerMatch {
                    customer,
                    confidence,
                    matched_by: MatchSource::Name,
                }
            })
            .filter(|m| m.confidence > 0)
            .collect();
        matches.sort_by(|a, b| b.confidence.cmp(&a.confidence));
        Ok(matches)
    }

    /// Matches from the first source that finds anything: email, then
    /// phone, then name.
    pub async fn smart_search(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<CustomerMatch>, TicketError> {
        let mut matches = Vec::new();

        if let Some(email) = email
            && let Some(found) = self.find_by_email(email).await?
        {
            matches.push(found);
        }
        if matches.is_empty()
            && let Some(phone) = phone
        {
            matches = self.find_by_phone(phone).await?;
        }
        if matches.is_empty()
            && let Some(name) = name
        {
            matches = self.find_by_name(name).await?;
        }

        let mut seen = HashSet::new();
        matches.retain(|m| seen.insert(m.customer.id));
        // Stable: earlier rows win ties
        matches.sort_by(|a, b| b.confidence.cmp(&a.confidence));
        Ok(matches)
    }

    /// Create a lead for a ticket requester, or return the customer that
    /// already owns the address. The flag is true when a row was inserted.
    pub async fn create_from_ticket(
        &self,
        email: &str,
        name: Option<&str>,
        phone: Option<&str>,
    ) -> Result<(Customer, bool), TicketError> {
        let Some(email) = normalize_email(email) else {
            return Err(TicketError::Invalid(format!("invalid email address: {}", email)));
        };

        if let Some(existing) = self.store.find_customer_by_email(&email).await? {
            return Ok((existing, false));
        }

        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| local_part(&email).to_string());

        let customer = self
            .store
            .insert_customer(&NewCustomer {
                name,
                email: Some(email),
                phone: phone.map(|p| p.trim().to_string()).filter(|p| !p.is_empty()),
                company: None,
                status: CustomerStatus::Lead,
                notes: Some("Created automatically from a helpdesk ticket".to_string()),
            })
            .await?;

        tracing::info!("Created customer {} for {}", customer.id, customer.name);
        Ok((customer, true))
    }

    /// Best automatic match for a requester, creating a customer if asked.
    pub async fn resolve(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
        name: Option<&str>,
        create: bool,
    ) -> Result<Association, TicketError> {
        let best = self
            .smart_search(email, phone, name)
            .await?
            .into_iter()
            .next()
            .filter(|m| m.confidence >= AUTO_ASSOCIATE_MIN_CONFIDENCE);
        if let Some(found) = best {
            return Ok(Association::Linked(found));
        }

        if create && let Some(email) = email {
            let (customer, created) = self.create_from_ticket(email, name, phone).await?;
            return Ok(if created {
                Association::Created(customer)
            } else {
                Association::Linked(CustomerMatch {
                    customer,
                    confidence: EMAIL_CONFIDENCE,
                    matched_by: MatchSource::Email,
                })
            });
        }

        Ok(Association::Unlinked)
    }

    pub async fn auto_associate_ticket(
        &self,
        ticket_id: i64,
        email: Option<&str>,
        phone: Option<&str>,
        name: Option<&str>,
        create: bool,
    ) -> Result<Association, TicketError> {
        let ticket = self
            .store
            .get_ticket(ticket_id)
            .await?
            .ok_or(TicketError::TicketNotFound(ticket_id))?;
        if let Some(customer_id) = ticket.customer_id {
            return Ok(Association::AlreadyLinked(customer_id));
        }

        let association = self.resolve(email, phone, name, create).await?;
        if let Some(customer_id) = association.customer_id() {
            self.store.set_ticket_customer(ticket_id, customer_id).await?;
            tracing::debug!("Ticket {} linked to customer {}", ticket.display_number, customer_id);
        }
        Ok(association)
    }

    async fn require_customer(&self, customer_id: i64) -> Result<Customer, TicketError> {
        self.store
            .get_customer(customer_id)
            .await?
            .ok_or(TicketError::CustomerNotFound(customer_id))
    }

    /// Tickets of a customer, newest first.
    pub async fn ticket_history(&self, customer_id: i64) -> Result<Vec<Ticket>, TicketError> {
        self.require_customer(customer_id).await?;
        Ok(self.store.tickets_for_customer(customer_id).await?)
    }

    pub async fn ticket_stats(&self, customer_id: i64) -> Result<CustomerTicketStats, TicketError> {
        self.require_customer(customer_id).await?;

        let mut stats = CustomerTicketStats::default();
        for (status, count) in self.store.ticket_status_counts(customer_id).await? {
            stats.total += count;
            match status {
                TicketStatus::Open => stats.open += count,
                TicketStatus::InProgress => stats.in_progress += count,
                TicketStatus::AwaitingCustomer => stats.awaiting_customer += count,
                TicketStatus::Resolved => stats.resolved += count,
                TicketStatus::Closed => stats.closed += count,
            }
        }
        if stats.total > 0 {
            let done = (stats.resolved + stats.closed) as f64;
            stats.resolution_rate = (done / stats.total as f64 * 100.0).round() as u32;
        }
        Ok(stats)
    }

    /// Associate every ticket that has no customer yet, in batches.
    pub async fn associate_unlinked(
        &self,
        batch_size: Option<i64>,
        create: bool,
    ) -> Result<AssociationSummary, TicketError> {
        let batch_size = batch_size.unwrap_or(ASSOCIATION_BATCH_SIZE).max(1);
        let mut summary = AssociationSummary::default();
        let mut after_id = 0;

        loop {
            let batch = self.store.unlinked_tickets(after_id, batch_size).await?;
            let Some(last) = batch.last() else {
                break;
            };
            after_id = last.id;

            for ticket in &batch {
                summary.scanned += 1;
                let association = self
                    .auto_associate_ticket(
                        ticket.id,
                        Some(&ticket.requester_email),
                        ticket.requester_phone.as_deref(),
                        Some(&ticket.requester_name),
                        create,
                    )
                    .await;
                match association {
                    Ok(Association::Created(_)) => summary.created += 1,
                    Ok(Association::Linked(_)) | Ok(Association::AlreadyLinked(_)) => {
                        summary.linked += 1
                    }
                    Ok(Association::Unlinked) => summary.unlinked += 1,
                    Err(e) => {
                        tracing::warn!("Failed to associate ticket {}: {}", ticket.id, e);
                        summary.unlinked += 1;
                    }
                }
            }
        }

        tracing::info!(
            "Customer association pass: {} scanned, {} linked, {} created",
            summary.scanned,
            summary.linked,
            summary.created
        );
        Ok(summary)
    }

    /// Copy details from each customer's newest ticket: a phone when the
    /// customer has none, and the requester name when it is longer.
    pub async fn enrich_customers(&self) -> Result<EnrichmentSummary, TicketError> {
        let mut summary = EnrichmentSummary::default();

        for customer in self.store.customers_with_tickets().await? {
            summary.scanned += 1;
            let tickets = self.store.tickets_for_customer(customer.id).await?;
            let Some(latest) = tickets.first() else {
                continue;
            };

            let mut phone = customer.phone.clone();
            if phone.as_deref().is_none_or(|p| p.trim().is_empty())
                && let Some(requester_phone) = latest.requester_phone.as_deref()
                && !requester_phone.trim().is_empty()
            {
                phone = Some(requester_phone.trim().to_string());
            }

            let mut name = customer.name.clone();
            let requester_name = latest.requester_name.trim();
            if requester_name.chars().count() > name.chars().count() {
                name = requester_name.to_string();
            }

            if phone != customer.phone || name != customer.name {
                self.store
                    .update_customer_contact(customer.id, &name, phone.as_deref())
                    .await?;
                tracing::debug!("Enriched customer {} from ticket {}", customer.id, latest.id);
                summary.updated += 1;
            }
        }

        tracing::info!(
            "Customer enrichment pass: {} scanned, {} updated",
            summary.scanned,
            summary.updated
        );
        Ok(summary)
    }

    /// Store [`potential_value`] for every customer with tickets. Customers
    /// whose value comes out as zero are left as they are.
    pub async fn refresh_potential_values(&self) -> Result<usize, TicketError> {
        let mut valued = 0;
        for customer in self.store.customers_with_tickets().await? {
            let tickets = self.store.tickets_for_customer(customer.id).await?;
            let value = potential_value(&tickets);
            if value > 0 {
                self.store
                    .set_customer_potential_value(customer.id, value)
                    .await?;
                valued += 1;
            }
        }
        Ok(valued)
    }

    pub async fn coverage_stats(&self) -> Result<CoverageCounts, TicketError> {
        Ok(self.store.coverage_counts().await?)
    }

    /// Associate, enrich and value in one run, then report coverage.
    pub async fn sync_clients(&self, create: bool) -> Result<ClientSyncReport, TicketError> {
        let association = self.associate_unlinked(None, create).await?;
        let enrichment = self.enrich_customers().await?;
        let valued = self.refresh_potential_values().await?;
        let coverage = self.coverage_stats().await?;
        Ok(ClientSyncReport {
            association,
            enrichment,
            valued,
            coverage,
        })
    }
}
