// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Selection of the translation context on vCPU resume.

use crate::backing::TranslationRegister;
use crate::domain::Domain;
use crate::domain::Vcpu;

/// Installs the translation context `vcpu` must run with: its bound view if
/// alternate views are active and the view still has valid tables, otherwise
/// the host view.
///
/// Runs on every vCPU entry. Never fails and never allocates; a missing view
/// is a normal fallback, not an error.
pub fn altp2m_vcpu_update_p2m(domain: &Domain, vcpu: &Vcpu, reg: &mut dyn TranslationRegister) {
    debug_assert_eq!(vcpu.domain_id(), domain.id());

    // Held across the install so the view cannot be torn down underneath
    // the vCPU.
    let state = domain.altp2m_state();
    let backing = domain.backing();

    let altp2m = if state.active {
        vcpu.altp2m_view()
            .filter(|&view| state.views.contains(view))
            .and_then(|view| backing.view_context(view).map(|context| (view, context)))
    } else {
        None
    };

    match altp2m {
        Some((view, context)) => {
            tracing::trace!(
                domain = %domain.id(),
                vp = vcpu.index(),
                %view,
                context = context.0,
                "install altp2m view"
            );
            reg.install(context);
        }
        None => {
            let context = backing.host_context();
            tracing::trace!(
                domain = %domain.id(),
                vp = vcpu.index(),
                context = context.0,
                "install host view"
            );
            reg.install(context);
        }
    }
}
