//! Acknowledgement mail sent to the requester of a new ticket.

use super::types::{Department, Priority, Ticket};
use crate::mail::OutgoingMail;

fn estimated_response(priority: Priority) -> &'static str {
    match priority {
        Priority::Urgent => "4 hours",
        Priority::High => "1 business day",
        Priority::Medium => "3 business days",
        Priority::Low => "5 business days",
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Build the acknowledgement for `ticket`, threaded under the source mail.
pub fn acknowledgement(ticket: &Ticket, department: &Department, source_message_id: &str) -> OutgoingMail {
    let eta = estimated_response(ticket.priority);
    let department_name = department.display_name();

    let text = format!(
        "Hello {name},\n\n\
         We received your message and opened ticket {number}.\n\n\
         Subject: {subject}\n\
         Department: {department}\n\
         Priority: {priority}\n\
         Estimated response time: {eta}\n\n\
         Reply to this email to add information to the ticket.\n\n\
         {department} team",
        name = ticket.requester_name,
        number = ticket.display_number,
        subject = ticket.subject,
        department = department_name,
        priority = ticket.priority.label(),
        eta = eta,
    );

    let html = format!(
        "<p>Hello {name},</p>\
         <p>We received your message and opened ticket <strong>{number}</strong>.</p>\
         <table>\
         <tr><td>Subject</td><td>{subject}</td></tr>\
         <tr><td>Department</td><td>{department}</td></tr>\
         <tr><td>Priority</td><td>{priority}</td></tr>\
         <tr><td>Estimated response time</td><td>{eta}</td></tr>\
         </table>\
         <p>Reply to this email to add information to the ticket.</p>\
         <p>{department} team</p>",
        name = escape_html(&ticket.requester_name),
        number = escape_html(&ticket.display_number),
        subject = escape_html(&ticket.subject),
        department = escape_html(&department_name),
        priority = ticket.priority.label(),
        eta = eta,
    );

    OutgoingMail {
        to: ticket.requester_email.clone(),
        subject: format!(
            "[Ticket {}] Confirmation of receipt - {}",
            ticket.display_number, ticket.subject
        ),
        text: Some(text),
        html: Some(html),
        in_reply_to: Some(source_message_id.to_string()),
        references: Some(source_message_id.to_string()),
        headers: vec![
            ("X-Ticket-Number".to_string(), ticket.display_number.clone()),
            ("X-Department".to_string(), department.name.clone()),
            ("X-Priority".to_string(), ticket.priority.as_str().to_string()),
        ],
    }
}
